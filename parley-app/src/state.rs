//! Host application state.
//!
//! One `AppState` lives for the whole process; the prompt loop and the event
//! printers share it through an `Arc`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use parley_core::{DiagnosticsSnapshot, ParleySession};
use serde::Serialize;

use crate::settings::AppSettings;

pub struct AppState {
    pub session: Arc<ParleySession>,
    /// Persisted settings cache.
    pub settings: Mutex<AppSettings>,
    /// Absolute path to `settings.json`.
    pub settings_path: PathBuf,
    /// Model turns heard since start (transitions into model-speaking).
    pub model_turns: AtomicUsize,
    /// Rolling connect latency.
    pub connect_ms: Mutex<StageWindow>,
}

impl AppState {
    pub fn new(session: ParleySession, settings: AppSettings, settings_path: PathBuf) -> Self {
        Self {
            session: Arc::new(session),
            settings: Mutex::new(settings),
            settings_path,
            model_turns: AtomicUsize::new(0),
            connect_ms: Mutex::new(StageWindow::default()),
        }
    }

    pub fn stats_snapshot(&self) -> AppStats {
        AppStats {
            session: self.session.diagnostics_snapshot(),
            model_turns: self.model_turns.load(Ordering::Relaxed),
            connect_ms: self.connect_ms.lock().snapshot(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStats {
    pub session: DiagnosticsSnapshot,
    pub model_turns: usize,
    pub connect_ms: StageSnapshot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSnapshot {
    pub count: usize,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

#[derive(Debug)]
pub struct StageWindow {
    samples: VecDeque<f64>,
    cap: usize,
    count: usize,
    sum_ms: f64,
    max_ms: f64,
}

impl Default for StageWindow {
    fn default() -> Self {
        Self {
            samples: VecDeque::with_capacity(64),
            cap: 64,
            count: 0,
            sum_ms: 0.0,
            max_ms: 0.0,
        }
    }
}

impl StageWindow {
    pub fn record(&mut self, elapsed_ms: f64) {
        let v = if elapsed_ms.is_finite() {
            elapsed_ms.max(0.0)
        } else {
            0.0
        };
        if self.samples.len() == self.cap {
            let _ = self.samples.pop_front();
        }
        self.samples.push_back(v);
        self.count = self.count.saturating_add(1);
        self.sum_ms += v;
        self.max_ms = self.max_ms.max(v);
    }

    pub fn snapshot(&self) -> StageSnapshot {
        if self.samples.is_empty() {
            return StageSnapshot::default();
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let percentile = |p: f64| -> f64 {
            let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };

        StageSnapshot {
            count: self.count,
            mean_ms: self.sum_ms / self.count as f64,
            p50_ms: percentile(0.50),
            p95_ms: percentile(0.95),
            max_ms: self.max_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_reports_zeroes() {
        assert_eq!(StageWindow::default().snapshot(), StageSnapshot::default());
    }

    #[test]
    fn window_tracks_percentiles_and_max() {
        let mut window = StageWindow::default();
        for ms in [120.0, 80.0, 100.0, f64::NAN, 400.0] {
            window.record(ms);
        }
        let snap = window.snapshot();
        assert_eq!(snap.count, 5);
        assert_eq!(snap.max_ms, 400.0);
        assert_eq!(snap.p50_ms, 100.0);
        assert!((snap.mean_ms - 140.0).abs() < 1e-9);
    }

    #[test]
    fn window_keeps_only_recent_samples() {
        let mut window = StageWindow::default();
        for _ in 0..64 {
            window.record(1000.0);
        }
        for _ in 0..64 {
            window.record(10.0);
        }
        let snap = window.snapshot();
        assert_eq!(snap.count, 128);
        assert_eq!(snap.p95_ms, 10.0);
        assert_eq!(snap.max_ms, 1000.0);
    }
}

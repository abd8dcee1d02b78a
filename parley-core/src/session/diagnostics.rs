use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Per-session counters. Shared by the capture thread, the outbound sender
/// and the event loop.
#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub frames_captured: AtomicUsize,
    pub chunks_sent: AtomicUsize,
    pub chunks_dropped: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub chunks_scheduled: AtomicUsize,
    pub codec_errors: AtomicUsize,
    pub interrupts: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.chunks_sent.store(0, Ordering::Relaxed);
        self.chunks_dropped.store(0, Ordering::Relaxed);
        self.chunks_received.store(0, Ordering::Relaxed);
        self.chunks_scheduled.store(0, Ordering::Relaxed);
        self.codec_errors.store(0, Ordering::Relaxed);
        self.interrupts.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_scheduled: self.chunks_scheduled.load(Ordering::Relaxed),
            codec_errors: self.codec_errors.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_captured: usize,
    pub chunks_sent: usize,
    pub chunks_dropped: usize,
    pub chunks_received: usize,
    pub chunks_scheduled: usize,
    pub codec_errors: usize,
    pub interrupts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_zeroes_every_counter() {
        let diagnostics = SessionDiagnostics::default();
        SessionDiagnostics::bump(&diagnostics.frames_captured);
        SessionDiagnostics::bump(&diagnostics.codec_errors);
        assert_eq!(diagnostics.snapshot().frames_captured, 1);

        diagnostics.reset();
        assert_eq!(diagnostics.snapshot(), DiagnosticsSnapshot::default());
    }
}

//! Sample-accurate playback timeline shared between the scheduler and the
//! output device callback.
//!
//! ```text
//!  PlaybackScheduler ──TimelineControl──► crossbeam (lock-free) ──► TimelineRenderer
//!        ▲                                                          (cpal callback)
//!        └──────────── completions (tokio unbounded) ◄──────────────────┘
//! ```
//!
//! The renderer is the only place samples are mixed. Time is the number of
//! frames it has rendered ([`FrameClock`]), so a start time computed by the
//! scheduler lands on an exact frame and consecutive items butt together with
//! no gap and no overlap.
//!
//! Starts travel through a bounded queue and can be refused when it is full.
//! Clearing is an epoch counter instead: every voice carries the epoch it was
//! started in and the renderer drops voices from older epochs, so a clear
//! always lands no matter how full the queue is.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tokio::sync::mpsc;
use tracing::warn;

use super::{ItemId, OutputFormat, PlaybackSink};
use crate::codec::DecodedBuffer;

/// Queue depth for start commands heading into the render callback.
const COMMAND_CAPACITY: usize = 1024;

/// Monotonic clock driven by the output device: frames rendered / sample rate.
#[derive(Debug)]
pub struct FrameClock {
    frames: AtomicU64,
    sample_rate: u32,
}

impl FrameClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: AtomicU64::new(0),
            sample_rate: sample_rate.max(1),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Seconds of audio rendered so far.
    pub fn now(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }

    fn frame_at(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64).round() as u64
    }
}

struct StartCommand {
    id: ItemId,
    buffer: Arc<DecodedBuffer>,
    start_frame: u64,
    epoch: u64,
}

/// Build a connected control/renderer pair for an output running at `format`.
///
/// Natural completions (a voice playing to its last frame) are reported on
/// `completions`. Cleared voices are not reported.
pub fn timeline(
    format: OutputFormat,
    completions: mpsc::UnboundedSender<ItemId>,
) -> (TimelineControl, TimelineRenderer) {
    let (commands_tx, commands_rx) = crossbeam_channel::bounded(COMMAND_CAPACITY);
    let clock = Arc::new(FrameClock::new(format.sample_rate));
    let epoch = Arc::new(AtomicU64::new(0));

    let control = TimelineControl {
        commands: commands_tx,
        clock: Arc::clone(&clock),
        epoch: Arc::clone(&epoch),
        format,
    };
    let renderer = TimelineRenderer {
        commands: commands_rx,
        voices: Vec::with_capacity(64),
        clock,
        epoch,
        channels: format.channels.max(1) as usize,
        completions,
    };
    (control, renderer)
}

/// Scheduler-side handle. Implements [`PlaybackSink`].
#[derive(Clone)]
pub struct TimelineControl {
    commands: Sender<StartCommand>,
    clock: Arc<FrameClock>,
    /// Bumped by every clear.
    epoch: Arc<AtomicU64>,
    format: OutputFormat,
}

impl TimelineControl {
    pub fn clock(&self) -> Arc<FrameClock> {
        Arc::clone(&self.clock)
    }
}

impl PlaybackSink for TimelineControl {
    fn now(&self) -> f64 {
        self.clock.now()
    }

    fn format(&self) -> OutputFormat {
        self.format
    }

    fn start(&mut self, id: ItemId, buffer: Arc<DecodedBuffer>, start_at: f64) -> bool {
        let command = StartCommand {
            id,
            buffer,
            start_frame: self.clock.frame_at(start_at),
            epoch: self.epoch.load(Ordering::Acquire),
        };
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%id, "playback command queue full, chunk refused");
                false
            }
            // Renderer gone: the output device has been released.
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn clear(&mut self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }
}

struct Voice {
    id: ItemId,
    buffer: Arc<DecodedBuffer>,
    start_frame: u64,
    epoch: u64,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.buffer.frames() as u64
    }
}

/// Device-side mixer. Lives inside the output stream callback.
pub struct TimelineRenderer {
    commands: Receiver<StartCommand>,
    voices: Vec<Voice>,
    clock: Arc<FrameClock>,
    epoch: Arc<AtomicU64>,
    channels: usize,
    completions: mpsc::UnboundedSender<ItemId>,
}

impl TimelineRenderer {
    /// Fill `out` (interleaved, `channels` wide) with the next block of audio
    /// and advance the clock by the number of frames written.
    pub fn render(&mut self, out: &mut [f32]) {
        self.apply_commands();

        out.fill(0.0);
        let ch = self.channels;
        let frames = (out.len() / ch) as u64;
        let base = self.clock.frames();
        let end = base + frames;

        for voice in &self.voices {
            let from = voice.start_frame.max(base);
            let to = voice.end_frame().min(end);
            if from >= to {
                continue;
            }
            let samples = voice.buffer.samples();
            let src_ch = (voice.buffer.channels() as usize).max(1);
            for abs in from..to {
                let dst = (abs - base) as usize * ch;
                let src = (abs - voice.start_frame) as usize * src_ch;
                for c in 0..ch {
                    out[dst + c] += samples[src + c.min(src_ch - 1)];
                }
            }
        }

        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
        self.clock.advance(frames);

        let completions = &self.completions;
        self.voices.retain(|voice| {
            let finished = voice.end_frame() <= end;
            if finished {
                let _ = completions.send(voice.id);
            }
            !finished
        });
    }

    /// Voices currently pending or playing.
    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    pub fn clock(&self) -> Arc<FrameClock> {
        Arc::clone(&self.clock)
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            // A start time already in the past plays immediately.
            let start_frame = command.start_frame.max(self.clock.frames());
            self.voices.push(Voice {
                id: command.id,
                buffer: command.buffer,
                start_frame,
                epoch: command.epoch,
            });
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        self.voices.retain(|v| v.epoch >= epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(format_rate: u32) -> OutputFormat {
        OutputFormat {
            sample_rate: format_rate,
            channels: 1,
        }
    }

    fn buffer(value: f32, frames: usize, rate: u32) -> Arc<DecodedBuffer> {
        Arc::new(DecodedBuffer::new(vec![value; frames], rate, 1))
    }

    #[test]
    fn voice_starts_on_its_exact_frame() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (mut control, mut renderer) = timeline(mono(1_000), tx);

        assert!(control.start(ItemId(0), buffer(0.5, 500, 1_000), 0.1));
        let mut out = vec![1.0f32; 240];
        renderer.render(&mut out);

        assert!(out[..100].iter().all(|&s| s == 0.0));
        assert!(out[100..].iter().all(|&s| s == 0.5));
        assert_eq!(renderer.clock().frames(), 240);
    }

    #[test]
    fn back_to_back_voices_leave_no_gap() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut control, mut renderer) = timeline(mono(1_000), tx);

        control.start(ItemId(0), buffer(0.25, 150, 1_000), 0.0);
        control.start(ItemId(1), buffer(0.5, 50, 1_000), 0.15);
        let mut out = vec![0.0f32; 250];
        renderer.render(&mut out);

        assert!(out[..150].iter().all(|&s| s == 0.25));
        assert!(out[150..200].iter().all(|&s| s == 0.5));
        assert!(out[200..].iter().all(|&s| s == 0.0));
        assert_eq!(rx.try_recv().ok(), Some(ItemId(0)));
        assert_eq!(rx.try_recv().ok(), Some(ItemId(1)));
        assert_eq!(renderer.voice_count(), 0);
    }

    #[test]
    fn cleared_voice_is_silenced_without_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut control, mut renderer) = timeline(mono(1_000), tx);

        assert!(control.start(ItemId(7), buffer(0.5, 1_000, 1_000), 0.0));
        let mut out = vec![0.0f32; 100];
        renderer.render(&mut out);
        assert_eq!(out[99], 0.5);

        control.clear();
        control.clear();
        renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn late_start_plays_immediately() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (mut control, mut renderer) = timeline(mono(1_000), tx);

        let mut out = vec![0.0f32; 100];
        renderer.render(&mut out);
        control.start(ItemId(0), buffer(0.5, 10, 1_000), 0.0);
        renderer.render(&mut out);

        assert!(out[..10].iter().all(|&s| s == 0.5));
        assert!(out[10..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn mono_voice_fills_every_output_channel() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let format = OutputFormat {
            sample_rate: 1_000,
            channels: 2,
        };
        let (mut control, mut renderer) = timeline(format, tx);

        control.start(ItemId(0), buffer(0.5, 4, 1_000), 0.0);
        let mut out = vec![0.0f32; 8];
        renderer.render(&mut out);
        assert_eq!(out, vec![0.5; 8]);
        assert_eq!(renderer.clock().frames(), 4);
    }

    #[test]
    fn clear_drops_every_voice() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut control, mut renderer) = timeline(mono(1_000), tx);

        control.start(ItemId(0), buffer(0.5, 10, 1_000), 0.0);
        control.start(ItemId(1), buffer(0.5, 10, 1_000), 0.01);
        control.clear();
        let mut out = vec![0.0f32; 40];
        renderer.render(&mut out);

        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(renderer.voice_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_refuses_starts_but_still_clears() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (mut control, mut renderer) = timeline(mono(1_000), tx);

        for i in 0..COMMAND_CAPACITY as u64 {
            assert!(control.start(ItemId(i), buffer(0.5, 10, 1_000), 0.0));
        }
        assert!(!control.start(ItemId(9_999), buffer(0.5, 10, 1_000), 0.0));

        control.clear();
        let mut out = vec![0.0f32; 40];
        renderer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(renderer.voice_count(), 0);
        assert!(rx.try_recv().is_err());

        // The queue drained; starts after the clear play normally.
        assert!(control.start(ItemId(10_000), buffer(0.25, 10, 1_000), 0.0));
        renderer.render(&mut out);
        assert!(out[..10].iter().all(|&s| s == 0.25));
        assert_eq!(rx.try_recv().ok(), Some(ItemId(10_000)));
    }

    #[test]
    fn start_after_the_renderer_is_gone_is_refused() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (mut control, renderer) = timeline(mono(1_000), tx);
        drop(renderer);
        assert!(!control.start(ItemId(0), buffer(0.5, 10, 1_000), 0.0));
    }
}

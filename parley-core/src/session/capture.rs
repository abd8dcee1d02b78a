//! Blocking capture loop: ring buffer → 16 kHz → fixed frames → codec → transport.
//!
//! ## Stages (per iteration)
//!
//! ```text
//! 1. Drain the ring buffer (device rate, mono)
//! 2. Convert to the outbound rate
//! 3. Cut into capture_block_size frames
//! 4. Encode each frame and hand it to the OutboundSender
//! ```
//!
//! Runs on the same blocking thread that owns the input stream, until the
//! shared `running` flag is cleared.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::{frame::AudioFrame, AudioConsumer, Consumer},
    codec,
    session::diagnostics::SessionDiagnostics,
    transport::{OutboundSender, SendOutcome},
};

/// Samples drained from the ring per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty.
const DEFAULT_SLEEP_EMPTY_MS: u64 = 5;

pub(crate) struct CaptureContext {
    pub consumer: AudioConsumer,
    pub running: Arc<AtomicBool>,
    pub device_sample_rate: u32,
    pub target_sample_rate: u32,
    pub block_size: usize,
    pub outbound: OutboundSender,
    pub diagnostics: Arc<SessionDiagnostics>,
    pub faults: mpsc::UnboundedSender<String>,
}

/// Run until `ctx.running` becomes false.
pub(crate) fn run(mut ctx: CaptureContext) {
    let mut converter =
        match RateConverter::new(ctx.device_sample_rate, ctx.target_sample_rate, DRAIN_CHUNK) {
            Ok(converter) => converter,
            Err(e) => {
                error!("failed to create capture resampler: {e}");
                let _ = ctx.faults.send(format!("microphone: {e}"));
                return;
            }
        };

    info!(
        device_rate = ctx.device_sample_rate,
        target_rate = ctx.target_sample_rate,
        block = ctx.block_size,
        "capture started"
    );

    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut assembler = FrameAssembler::new(ctx.block_size, ctx.target_sample_rate);
    let mut writer_gone = false;

    while ctx.running.load(Ordering::Relaxed) {
        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(Duration::from_millis(empty_sleep_ms()));
            continue;
        }

        let converted = converter.process(&raw[..n]);
        for frame in assembler.push(&converted) {
            SessionDiagnostics::bump(&ctx.diagnostics.frames_captured);
            match ctx.outbound.send(codec::encode(&frame)) {
                Ok(SendOutcome::Queued) => debug!(samples = frame.len(), "frame queued"),
                Ok(_) => {}
                // The transport reports its own failure; keep draining the ring.
                Err(e) if !writer_gone => {
                    warn!("outbound writer unavailable: {e}");
                    writer_gone = true;
                }
                Err(_) => {}
            }
        }
    }

    info!("capture stopped");
}

fn empty_sleep_ms() -> u64 {
    static EMPTY_SLEEP_MS: OnceLock<u64> = OnceLock::new();
    *EMPTY_SLEEP_MS.get_or_init(|| {
        std::env::var("PARLEY_CAPTURE_EMPTY_SLEEP_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(DEFAULT_SLEEP_EMPTY_MS)
    })
}

/// Cuts a continuous sample stream into fixed-length frames.
pub(crate) struct FrameAssembler {
    block_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub(crate) fn new(block_size: usize, sample_rate: u32) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            sample_rate,
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Append samples; returns every frame completed by them, oldest first.
    pub(crate) fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.block_size;
        if complete == 0 {
            return Vec::new();
        }

        let frames = self
            .pending
            .chunks_exact(self.block_size)
            .map(|block| AudioFrame::new(block.to_vec(), self.sample_rate))
            .collect();
        self.pending.drain(..complete * self.block_size);
        frames
    }
}

//! Gapless playback of inbound speech chunks.
//!
//! Chunks arrive with network jitter. [`PlaybackScheduler`] keeps a cursor on
//! the output clock marking where the previously queued audio ends; each new
//! chunk starts at `max(cursor, now)`. Jitter therefore never produces gaps
//! between chunks that arrive ahead of the cursor, and never overlaps
//! chunks that arrive late.
//!
//! The chunks of one model turn are one signal, so they go through a single
//! [`InboundResampler`] when the device rate differs from the wire rate. The
//! resampler may hold a few milliseconds back; [`PlaybackScheduler::flush`]
//! schedules that tail at the end of the turn.
//!
//! The scheduler owns no device. It drives a [`PlaybackSink`]: in production
//! the [`timeline::TimelineControl`] feeding the output stream callback, in
//! tests a manual clock.

pub mod timeline;

use std::{collections::BTreeMap, fmt, sync::Arc};

use tracing::{debug, warn};

use crate::codec::{self, CodecError, DecodedBuffer, EncodedChunk, InboundResampler};

/// Identifier of one scheduled chunk, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId(pub u64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Sample layout of the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Output side of the scheduler: a clock plus start/clear of buffers.
pub trait PlaybackSink: Send + 'static {
    /// Current output time in seconds. Monotonic.
    fn now(&self) -> f64;

    /// Layout buffers must be decoded to.
    fn format(&self) -> OutputFormat;

    /// Begin `buffer` at output time `start_at`. A time in the past plays
    /// immediately. Returns `false` when the sink refused the buffer; it
    /// will then never report a completion for `id`.
    fn start(&mut self, id: ItemId, buffer: Arc<DecodedBuffer>, start_at: f64) -> bool;

    /// Silence and drop everything the sink holds, without completions.
    /// Must not be lost.
    fn clear(&mut self);
}

/// A decoded chunk placed on the output timeline.
#[derive(Debug, Clone)]
pub struct PlaybackItem {
    id: ItemId,
    start_at: f64,
    duration: f64,
    buffer: Arc<DecodedBuffer>,
}

impl PlaybackItem {
    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn start_at(&self) -> f64 {
        self.start_at
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }

    pub fn buffer(&self) -> &Arc<DecodedBuffer> {
        &self.buffer
    }
}

pub struct PlaybackScheduler<S: PlaybackSink> {
    sink: S,
    /// Output time at which the last queued item ends.
    cursor: f64,
    active: BTreeMap<ItemId, PlaybackItem>,
    next_id: u64,
    /// Converts the current turn to the sink rate.
    inbound: InboundResampler,
}

impl<S: PlaybackSink> PlaybackScheduler<S> {
    pub fn new(sink: S) -> Self {
        let inbound = InboundResampler::new(sink.format().sample_rate);
        Self {
            sink,
            cursor: 0.0,
            active: BTreeMap::new(),
            next_id: 0,
            inbound,
        }
    }

    /// Decode `chunk` for the sink and queue it right after everything
    /// already queued.
    ///
    /// Returns `Ok(None)` when nothing was queued: the resampler is still
    /// holding the audio back, or the sink refused it.
    ///
    /// # Errors
    /// Returns the codec error for malformed input. Nothing is queued and the
    /// cursor does not move in that case.
    pub fn enqueue(&mut self, chunk: &EncodedChunk) -> Result<Option<&PlaybackItem>, CodecError> {
        let channels = self.sink.format().channels;
        let buffer = codec::decode_stream(chunk, &mut self.inbound, channels)?;
        Ok(self.schedule(buffer))
    }

    /// Queue whatever the resampler held back for the current turn. Call
    /// when the turn is complete.
    pub fn flush(&mut self) -> Option<&PlaybackItem> {
        let channels = self.sink.format().channels;
        let tail = self.inbound.flush(channels)?;
        self.schedule(tail)
    }

    /// Queue an already-decoded buffer.
    ///
    /// Empty buffers are skipped. If the sink refuses the buffer the cursor
    /// stays where it was and `None` is returned.
    pub fn schedule(&mut self, buffer: DecodedBuffer) -> Option<&PlaybackItem> {
        if buffer.is_empty() {
            return None;
        }
        let now = self.sink.now();
        let start_at = self.cursor.max(now);
        let duration = buffer.duration_secs();
        let id = ItemId(self.next_id);

        let buffer = Arc::new(buffer);
        if !self.sink.start(id, Arc::clone(&buffer), start_at) {
            warn!(%id, duration, "output refused chunk; dropped");
            return None;
        }
        self.next_id += 1;
        self.cursor = start_at + duration;
        debug!(%id, start_at, duration, lead = start_at - now, "chunk scheduled");

        Some(self.active.entry(id).or_insert(PlaybackItem {
            id,
            start_at,
            duration,
            buffer,
        }))
    }

    /// Record that `id` played to its end.
    ///
    /// Returns `true` exactly when this completion empties the active set,
    /// i.e. the model has finished speaking. Unknown ids (already stopped by
    /// an interrupt) are ignored.
    pub fn complete(&mut self, id: ItemId) -> bool {
        if self.active.remove(&id).is_none() {
            return false;
        }
        self.active.is_empty()
    }

    /// Stop every queued item, drop the turn's held-back audio and pull the
    /// cursor back to the present.
    ///
    /// Returns the number of items stopped. Calling it again is harmless.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        if stopped > 0 {
            self.sink.clear();
            debug!(stopped, "playback interrupted");
        }
        self.active.clear();
        self.inbound.reset();
        self.cursor = self.sink.now();
        stopped
    }

    /// Interrupt, and clear the sink even when nothing is tracked. Used on
    /// teardown.
    pub fn reset(&mut self) {
        if self.interrupt() == 0 {
            self.sink.clear();
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn now(&self) -> f64 {
        self.sink.now()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

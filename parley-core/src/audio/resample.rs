//! Sample-rate conversion using rubato's `FastFixedIn` resampler.
//!
//! [`RateConverter`] is a streaming converter: partial input is carried over
//! between calls and the interpolator history survives from one call to the
//! next, so a signal cut into arbitrary pieces comes out without seams. Two
//! streams use it:
//!
//! - **capture**: ring-buffer drains at the microphone's native rate
//!   (commonly 48 kHz) become a continuous 16 kHz stream.
//! - **playback**: the inbound speech chunks of one model turn (24 kHz) are
//!   one stream to the output device rate. [`RateConverter::flush`] emits the
//!   tail when the turn ends; [`RateConverter::reset`] drops it on barge-in.
//!
//! Output is aligned with the input: the interpolator delay is trimmed from
//! the front and a flush pads the back, so `n` input frames come out as
//! `round(n * target / source)` frames in total.
//!
//! Equal rates are a passthrough; no rubato state is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{ParleyError, Result};

/// Streaming f32 mono converter between two fixed sample rates.
pub struct RateConverter {
    /// `None` when source rate == target rate.
    resampler: Option<FastFixedIn<f32>>,
    /// Holds partial input between calls.
    pending: Vec<f32>,
    /// Input frames rubato consumes per call.
    chunk_size: usize,
    /// Reused output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    ratio: f64,
    /// Leading output frames still to drop (interpolator delay).
    skip: usize,
    frames_in: u64,
    frames_out: u64,
}

impl RateConverter {
    /// # Errors
    /// Returns `ParleyError::AudioDevice` if rubato rejects the ratio.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        let chunk_size = chunk_size.max(1);
        let ratio = target_rate as f64 / source_rate as f64;
        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                ratio,
                skip: 0,
                frames_in: 0,
                frames_out: 0,
            });
        }

        let resampler = new_resampler(source_rate, target_rate, chunk_size)
            .map_err(|e| ParleyError::AudioDevice(format!("resampler init: {e}")))?;
        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];
        let skip = resampler.output_delay();

        info!(source_rate, target_rate, chunk_size, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf,
            ratio,
            skip,
            frames_in: 0,
            frames_out: 0,
        })
    }

    /// Feed samples; returns whatever converted output is ready (may be empty).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        self.frames_in += samples.len() as u64;
        let mut out = Vec::new();

        while self.pending.len() >= self.chunk_size {
            let block = &self.pending[..self.chunk_size];
            match resampler.process_into_buffer(&[block], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => emit(
                    &self.output_buf[0][..produced],
                    &mut self.skip,
                    &mut self.frames_out,
                    &mut out,
                ),
                Err(e) => error!("resampler process error: {e}"),
            }
            self.pending.drain(..self.chunk_size);
        }

        out
    }

    /// End the stream: convert the carried-over input, pad out the
    /// interpolator delay and return the remaining output. The converter is
    /// ready for a new stream afterwards.
    pub fn flush(&mut self) -> Vec<f32> {
        let expected = (self.frames_in as f64 * self.ratio).round() as u64;
        let mut out = Vec::new();
        let Some(ref mut resampler) = self.resampler else {
            return out;
        };

        if !self.pending.is_empty() {
            match resampler.process_partial_into_buffer(
                Some(&[self.pending.as_slice()][..]),
                &mut self.output_buf,
                None,
            ) {
                Ok((_consumed, produced)) => emit(
                    &self.output_buf[0][..produced],
                    &mut self.skip,
                    &mut self.frames_out,
                    &mut out,
                ),
                Err(e) => error!("resampler flush error: {e}"),
            }
        }
        // Each zero block yields about `chunk_size * ratio` frames; a few
        // always cover the delay.
        for _ in 0..4 {
            if self.frames_out >= expected {
                break;
            }
            match resampler.process_partial_into_buffer(
                None::<&[&[f32]]>,
                &mut self.output_buf,
                None,
            ) {
                Ok((_consumed, produced)) => emit(
                    &self.output_buf[0][..produced],
                    &mut self.skip,
                    &mut self.frames_out,
                    &mut out,
                ),
                Err(e) => {
                    error!("resampler flush error: {e}");
                    break;
                }
            }
        }

        let overshoot = self.frames_out.saturating_sub(expected) as usize;
        out.truncate(out.len().saturating_sub(overshoot));
        self.reset();
        out
    }

    /// Drop carried-over input and interpolator history.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.frames_in = 0;
        self.frames_out = 0;
        if let Some(ref mut resampler) = self.resampler {
            resampler.reset();
            self.skip = resampler.output_delay();
        }
    }

    /// Input frames held back until the next full block or flush.
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

fn emit(produced: &[f32], skip: &mut usize, frames_out: &mut u64, out: &mut Vec<f32>) {
    let dropped = (*skip).min(produced.len());
    *skip -= dropped;
    out.extend_from_slice(&produced[dropped..]);
    *frames_out += (produced.len() - dropped) as u64;
}

fn new_resampler(
    source_rate: u32,
    target_rate: u32,
    chunk_size: usize,
) -> std::result::Result<FastFixedIn<f32>, rubato::ResamplerConstructionError> {
    FastFixedIn::<f32>::new(
        target_rate as f64 / source_rate as f64,
        1.0, // fixed ratio
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )
}

//! One capture tick worth of microphone audio.

use std::sync::Arc;

/// A fixed-length block of mono PCM samples produced by one capture tick.
///
/// Immutable once built: the samples live behind an `Arc<[f32]>` so the frame
/// can be handed between pipeline stages without copying or mutation.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Mono f32 samples, nominally in [-1.0, 1.0].
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_of_a_capture_block() {
        let frame = AudioFrame::new(vec![0.0f32; 4096], 16_000);
        assert_eq!(frame.len(), 4096);
        assert!((frame.duration_secs() - 0.256).abs() < 1e-9);
    }

    #[test]
    fn zero_rate_has_zero_duration() {
        let frame = AudioFrame::new(vec![0.0f32; 10], 0);
        assert_eq!(frame.duration_secs(), 0.0);
    }
}

//! Audio devices via the cpal backend.
//!
//! # Design constraints
//!
//! cpal callbacks run on OS audio threads at elevated priority. They must not
//! block on a mutex or perform I/O. Capture writes into an SPSC ring buffer
//! producer (`push_slice` is lock-free); playback reads from the
//! [`TimelineRenderer`](crate::playback::timeline::TimelineRenderer), which
//! only touches a lock-free command channel.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Every [`AudioBackend`] method is therefore called on a dedicated
//! blocking thread, and the returned [`StreamGuard`] is dropped on that same
//! thread. The session does this inside `spawn_blocking`.

pub mod device;
#[cfg(feature = "audio-cpal")]
mod output;
pub mod resample;

use std::{
    any::Any,
    sync::{atomic::AtomicBool, Arc},
};

use tokio::sync::mpsc;

use crate::{
    audio::device::DeviceInfo,
    buffering::AudioProducer,
    error::Result,
    playback::{timeline::TimelineControl, ItemId},
};

/// Keeps an open device stream alive. Dropping it closes the device.
///
/// **Not `Send`** in general: drop it on the thread that created it.
pub struct StreamGuard {
    /// Rate the device actually runs at (Hz).
    pub sample_rate: u32,
    pub channels: u16,
    _stream: Box<dyn Any>,
}

impl StreamGuard {
    pub fn new(sample_rate: u32, channels: u16, stream: impl Any) -> Self {
        Self {
            sample_rate,
            channels,
            _stream: Box::new(stream),
        }
    }
}

impl std::fmt::Debug for StreamGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamGuard")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

/// Source of microphone and speaker streams.
///
/// `faults` receives a message when a running stream fails (device unplugged,
/// driver reset). The session treats that as fatal.
pub trait AudioBackend: Send + Sync + 'static {
    /// Open the microphone and push mono f32 samples at the device rate into
    /// `producer` while `running` is set.
    fn open_input(
        &self,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device: Option<&str>,
        faults: mpsc::UnboundedSender<String>,
    ) -> Result<StreamGuard>;

    /// Open the speaker, preferring `preferred_rate`, and return the control
    /// handle of the timeline that feeds it.
    fn open_output(
        &self,
        preferred_device: Option<&str>,
        preferred_rate: u32,
        completions: mpsc::UnboundedSender<ItemId>,
        faults: mpsc::UnboundedSender<String>,
    ) -> Result<(StreamGuard, TimelineControl)>;

    fn input_devices(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }

    fn output_devices(&self) -> Vec<DeviceInfo> {
        Vec::new()
    }
}

/// The system audio host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalBackend;

#[cfg(feature = "audio-cpal")]
mod capture {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use cpal::{
        traits::{DeviceTrait, StreamTrait},
        Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
    };
    use tokio::sync::mpsc;
    use tracing::{error, info, warn};

    use super::StreamGuard;
    use crate::{
        audio::device::{select_device, DeviceDirection},
        buffering::{AudioProducer, Producer},
        error::{ParleyError, Result},
    };

    pub(super) fn open(
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device: Option<&str>,
        faults: mpsc::UnboundedSender<String>,
    ) -> Result<StreamGuard> {
        let device = select_device(DeviceDirection::Input, preferred_device)?;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let config: StreamConfig = supported.config();

        info!(sample_rate, channels, "capture config selected");

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build::<f32>(&device, &config, producer, running, faults),
            SampleFormat::I16 => build::<i16>(&device, &config, producer, running, faults),
            SampleFormat::U16 => build::<u16>(&device, &config, producer, running, faults),
            SampleFormat::U8 => build::<u8>(&device, &config, producer, running, faults),
            fmt => {
                return Err(ParleyError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

        Ok(StreamGuard::new(sample_rate, 1, stream))
    }

    /// Build an input stream that downmixes every frame to mono f32.
    fn build<T>(
        device: &Device,
        config: &StreamConfig,
        mut producer: AudioProducer,
        running: Arc<AtomicBool>,
        faults: mpsc::UnboundedSender<String>,
    ) -> Result<Stream>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let ch = (config.channels as usize).max(1);
        let mut mix: Vec<f32> = Vec::new();

        device
            .build_input_stream(
                config,
                move |data: &[T], _info| {
                    if !running.load(Ordering::Relaxed) {
                        return;
                    }
                    mix.clear();
                    mix.extend(data.chunks_exact(ch).map(|frame| {
                        frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / ch as f32
                    }));
                    let written = producer.push_slice(&mix);
                    if written < mix.len() {
                        warn!("ring buffer full: dropped {} frames", mix.len() - written);
                    }
                },
                move |err| {
                    error!("input stream error: {err}");
                    let _ = faults.send(format!("microphone: {err}"));
                },
                None,
            )
            .map_err(|e| ParleyError::AudioStream(e.to_string()))
    }
}

#[cfg(feature = "audio-cpal")]
impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        producer: AudioProducer,
        running: Arc<AtomicBool>,
        preferred_device: Option<&str>,
        faults: mpsc::UnboundedSender<String>,
    ) -> Result<StreamGuard> {
        capture::open(producer, running, preferred_device, faults)
    }

    fn open_output(
        &self,
        preferred_device: Option<&str>,
        preferred_rate: u32,
        completions: mpsc::UnboundedSender<ItemId>,
        faults: mpsc::UnboundedSender<String>,
    ) -> Result<(StreamGuard, TimelineControl)> {
        output::open(preferred_device, preferred_rate, completions, faults)
    }

    fn input_devices(&self) -> Vec<DeviceInfo> {
        device::list_input_devices()
    }

    fn output_devices(&self) -> Vec<DeviceInfo> {
        device::list_output_devices()
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        _producer: AudioProducer,
        _running: Arc<AtomicBool>,
        _preferred_device: Option<&str>,
        _faults: mpsc::UnboundedSender<String>,
    ) -> Result<StreamGuard> {
        Err(crate::error::ParleyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    fn open_output(
        &self,
        _preferred_device: Option<&str>,
        _preferred_rate: u32,
        _completions: mpsc::UnboundedSender<ItemId>,
        _faults: mpsc::UnboundedSender<String>,
    ) -> Result<(StreamGuard, TimelineControl)> {
        Err(crate::error::ParleyError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

//! Speaker stream driving the playback timeline.

use cpal::{
    traits::{DeviceTrait, StreamTrait},
    Device, FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::StreamGuard;
use crate::{
    audio::device::{select_device, DeviceDirection},
    error::{ParleyError, Result},
    playback::{
        timeline::{timeline, TimelineControl, TimelineRenderer},
        ItemId, OutputFormat,
    },
};

pub(super) fn open(
    preferred_device: Option<&str>,
    preferred_rate: u32,
    completions: mpsc::UnboundedSender<ItemId>,
    faults: mpsc::UnboundedSender<String>,
) -> Result<(StreamGuard, TimelineControl)> {
    let device = select_device(DeviceDirection::Output, preferred_device)?;
    let (config, sample_format) = choose_config(&device, preferred_rate)?;

    info!(
        device = device.name().unwrap_or_default().as_str(),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        ?sample_format,
        "opening output device"
    );

    let format = OutputFormat {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };
    let (control, renderer) = timeline(format, completions);

    let stream = match sample_format {
        SampleFormat::F32 => build::<f32>(&device, &config, renderer, faults),
        SampleFormat::I16 => build::<i16>(&device, &config, renderer, faults),
        SampleFormat::U16 => build::<u16>(&device, &config, renderer, faults),
        fmt => {
            return Err(ParleyError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }?;

    stream
        .play()
        .map_err(|e| ParleyError::AudioStream(e.to_string()))?;

    Ok((
        StreamGuard::new(format.sample_rate, format.channels, stream),
        control,
    ))
}

/// Prefer `preferred_rate` mono, then stereo, then the device default.
fn choose_config(device: &Device, preferred_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
    let rate = SampleRate(preferred_rate);
    let supports = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels
                && c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
                && matches!(
                    c.sample_format(),
                    SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
                )
        })
    };

    if let Some(range) = supports(1).or_else(|| supports(2)) {
        let supported = range.with_sample_rate(rate);
        return Ok((supported.config(), supported.sample_format()));
    }

    let supported = device
        .default_output_config()
        .map_err(|e| ParleyError::AudioDevice(e.to_string()))?;
    debug!(
        preferred_rate,
        actual = supported.sample_rate().0,
        "output does not support preferred rate, using default config"
    );
    Ok((supported.config(), supported.sample_format()))
}

fn build<T>(
    device: &Device,
    config: &StreamConfig,
    mut renderer: TimelineRenderer,
    faults: mpsc::UnboundedSender<String>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let mut mix: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| {
                mix.resize(data.len(), 0.0);
                renderer.render(&mut mix);
                for (out, &s) in data.iter_mut().zip(mix.iter()) {
                    *out = T::from_sample(s);
                }
            },
            move |err| {
                error!("output stream error: {err}");
                let _ = faults.send(format!("speaker: {err}"));
            },
            None,
        )
        .map_err(|e| ParleyError::AudioStream(e.to_string()))
}

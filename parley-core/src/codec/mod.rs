//! PCM codec: normalized f32 ⇄ 16-bit little-endian PCM ⇄ base64.
//!
//! ```text
//! outbound:  AudioFrame ─clamp─► i16 LE bytes ─base64─► EncodedChunk("audio/pcm;rate=16000")
//! inbound:   EncodedChunk ─base64⁻¹─► i16 LE ─► f32 ─resample─► interleave ─► DecodedBuffer
//! ```
//!
//! Everything here is a pure function except [`decode_stream`], whose
//! [`InboundResampler`] carries the resampling state of one model turn from
//! chunk to chunk.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tracing::debug;

use crate::audio::resample::RateConverter;
use crate::buffering::frame::AudioFrame;

/// Bytes per encoded sample (16-bit PCM).
pub const SAMPLE_WIDTH: usize = 2;

/// Rate assumed for inbound chunks whose tag does not carry `rate=`.
pub const DEFAULT_INBOUND_RATE: u32 = 24_000;

const PCM_MIME_PREFIX: &str = "audio/pcm";

/// Inbound frames per resampler block: 20 ms at 24 kHz.
const INBOUND_BLOCK: usize = 480;

/// Errors produced while decoding an inbound chunk.
///
/// These are per-chunk: the chunk is dropped and the session carries on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed base64 payload: {0}")]
    Base64(String),

    #[error("payload of {len} bytes is not a whole number of 16-bit samples")]
    OddByteLength { len: usize },

    #[error("unsupported or malformed media type: {0}")]
    MediaType(String),

    #[error("invalid output layout: {sample_rate} Hz, {channels} channel(s)")]
    InvalidLayout { sample_rate: u32, channels: u16 },

    #[error("resampling failed: {0}")]
    Resample(String),
}

/// One transport-ready unit of audio: base64 PCM plus its media tag.
///
/// Field names match the Live API blob shape so the value can be placed on
/// the wire as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedChunk {
    mime_type: String,
    data: String,
}

impl EncodedChunk {
    pub fn new(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Build a chunk from raw little-endian PCM bytes.
    pub fn from_pcm_bytes(bytes: &[u8], sample_rate: u32) -> Self {
        Self::new(pcm_mime_type(sample_rate), BASE64.encode(bytes))
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    /// Base64 payload.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Sample rate declared by the media tag, `None` when the tag has no `rate=`.
    ///
    /// # Errors
    /// `CodecError::MediaType` when the tag is not PCM or the rate is unparsable.
    pub fn declared_sample_rate(&self) -> Result<Option<u32>, CodecError> {
        parse_pcm_rate(&self.mime_type)
    }
}

/// Decoded inbound audio, interleaved and ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl DecodedBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Interleaved samples (`frames × channels`).
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames (one sample per channel each).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// `audio/pcm;rate=<hz>`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("{PCM_MIME_PREFIX};rate={sample_rate}")
}

/// Encode one captured frame. Out-of-range samples are clamped, never rejected.
pub fn encode(frame: &AudioFrame) -> EncodedChunk {
    EncodedChunk::from_pcm_bytes(&to_pcm16_le(frame.samples()), frame.sample_rate())
}

/// Resampling state for a stream of inbound chunks (one model turn).
///
/// Chunks of one turn are slices of a single signal; converting them through
/// one converter keeps the seams clean and the total length exact.
pub struct InboundResampler {
    target_rate: u32,
    /// Converter plus the source rate it was built for.
    converter: Option<(u32, RateConverter)>,
}

impl InboundResampler {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            converter: None,
        }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Input frames held back until the next chunk or [`flush`](Self::flush).
    pub fn pending_frames(&self) -> usize {
        self.converter
            .as_ref()
            .map_or(0, |(_, converter)| converter.pending_frames())
    }

    /// End the turn and return its tail, if any.
    pub fn flush(&mut self, channels: u16) -> Option<DecodedBuffer> {
        let (_, converter) = self.converter.as_mut()?;
        let tail = converter.flush();
        if tail.is_empty() || channels == 0 {
            return None;
        }
        Some(DecodedBuffer::new(
            interleave(&tail, channels),
            self.target_rate,
            channels,
        ))
    }

    /// Forget the current turn, including any held-back input.
    pub fn reset(&mut self) {
        if let Some((_, converter)) = self.converter.as_mut() {
            converter.reset();
        }
    }

    fn converter_for(&mut self, source_rate: u32) -> Result<&mut RateConverter, CodecError> {
        let stale = !matches!(self.converter, Some((rate, _)) if rate == source_rate);
        if stale {
            if self.converter.is_some() {
                debug!(source_rate, "inbound rate changed; restarting resampler");
            }
            let converter = RateConverter::new(source_rate, self.target_rate, INBOUND_BLOCK)
                .map_err(|e| CodecError::Resample(e.to_string()))?;
            self.converter = Some((source_rate, converter));
        }
        match self.converter.as_mut() {
            Some((_, converter)) => Ok(converter),
            None => Err(CodecError::Resample("no converter".into())),
        }
    }
}

/// Decode a self-contained chunk into a buffer at `target_sample_rate` with
/// `channels` interleaved channels (mono content is duplicated).
///
/// # Errors
/// See [`CodecError`]. A failed decode leaves no side effects.
pub fn decode(
    chunk: &EncodedChunk,
    target_sample_rate: u32,
    channels: u16,
) -> Result<DecodedBuffer, CodecError> {
    let mut resampler = InboundResampler::new(target_sample_rate);
    let head = decode_stream(chunk, &mut resampler, channels)?;
    let Some(tail) = resampler.flush(channels) else {
        return Ok(head);
    };
    let mut samples = head.samples;
    samples.extend_from_slice(tail.samples());
    Ok(DecodedBuffer::new(samples, target_sample_rate, channels))
}

/// Decode the next chunk of a stream through `resampler`.
///
/// When the rates differ, up to one resampler block of input is held back
/// for the next chunk, so the result may be shorter than the chunk (or
/// empty); [`InboundResampler::flush`] returns the rest.
///
/// # Errors
/// See [`CodecError`]. A failed decode leaves `resampler` untouched.
pub fn decode_stream(
    chunk: &EncodedChunk,
    resampler: &mut InboundResampler,
    channels: u16,
) -> Result<DecodedBuffer, CodecError> {
    let target_sample_rate = resampler.target_rate();
    if target_sample_rate == 0 || channels == 0 {
        return Err(CodecError::InvalidLayout {
            sample_rate: target_sample_rate,
            channels,
        });
    }

    let source_rate = chunk
        .declared_sample_rate()?
        .unwrap_or(DEFAULT_INBOUND_RATE);

    let bytes = BASE64
        .decode(chunk.data())
        .map_err(|e| CodecError::Base64(e.to_string()))?;
    let mono = from_pcm16_le(&bytes)?;
    let mono = resampler.converter_for(source_rate)?.process(&mono);

    Ok(DecodedBuffer::new(
        interleave(&mono, channels),
        target_sample_rate,
        channels,
    ))
}

/// Clamp, scale and serialise samples as 16-bit little-endian PCM.
pub fn to_pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * SAMPLE_WIDTH);
    for &s in samples {
        // NaN clamps to NaN; treat it as silence.
        let s = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
        let v = (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Parse 16-bit little-endian PCM into normalized f32.
///
/// # Errors
/// `CodecError::OddByteLength` when the byte count is not a multiple of 2.
pub fn from_pcm16_le(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % SAMPLE_WIDTH != 0 {
        return Err(CodecError::OddByteLength { len: bytes.len() });
    }
    Ok(bytes
        .chunks_exact(SAMPLE_WIDTH)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect())
}

fn interleave(mono: &[f32], channels: u16) -> Vec<f32> {
    if channels == 1 {
        return mono.to_vec();
    }
    let ch = channels as usize;
    let mut out = Vec::with_capacity(mono.len() * ch);
    for &s in mono {
        out.extend(std::iter::repeat(s).take(ch));
    }
    out
}

fn parse_pcm_rate(mime_type: &str) -> Result<Option<u32>, CodecError> {
    let mut parts = mime_type.split(';').map(str::trim);
    let essence = parts.next().unwrap_or_default();
    if !essence.eq_ignore_ascii_case(PCM_MIME_PREFIX) {
        return Err(CodecError::MediaType(mime_type.to_string()));
    }

    for param in parts {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("rate") {
            return match value.trim().parse::<u32>() {
                Ok(rate) if rate > 0 => Ok(Some(rate)),
                _ => Err(CodecError::MediaType(mime_type.to_string())),
            };
        }
    }
    Ok(None)
}

//! Configuration for a voice session.

use serde::{Deserialize, Serialize};

/// Default model for the Live API.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Default prebuilt voice.
pub const DEFAULT_VOICE: &str = "Fenrir";

/// Per-conversation settings passed to [`connect`](crate::session::ParleySession::connect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Prebuilt voice name the model speaks with.
    pub response_voice: String,
    /// Behavioral instruction sent once at setup.
    pub system_prompt: String,
    /// When `false` the model also returns text parts.
    pub audio_only: bool,
    /// Live API model id. A bare id is sent as `models/<id>`.
    pub model: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_voice: DEFAULT_VOICE.into(),
            system_prompt: String::new(),
            audio_only: true,
            model: DEFAULT_MODEL.into(),
        }
    }
}

/// Device and format settings, fixed for the lifetime of a session handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    /// Rate of outbound audio (Hz). Default: 16000.
    pub capture_sample_rate: u32,
    /// Rate the output device is asked for (Hz). Default: 24000.
    pub playback_sample_rate: u32,
    /// Samples per outbound frame. Default: 4096 (256 ms at 16 kHz).
    pub capture_block_size: usize,
    /// Encoded frames buffered towards the network before dropping. Default: 64.
    pub outbound_queue: usize,
    /// Exact device name; falls back to the system default when missing.
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16_000,
            playback_sample_rate: 24_000,
            capture_block_size: 4096,
            outbound_queue: 64,
            preferred_input_device: None,
            preferred_output_device: None,
        }
    }
}

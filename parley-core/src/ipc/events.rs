//! Notifications published by a [`ParleySession`](crate::session::ParleySession).
//!
//! ## Channels
//!
//! | Event | Subscribe with |
//! |-------|----------------|
//! | `ConnectionStatusEvent` | `ParleySession::subscribe_status()` |
//! | `SpeakingStateEvent` | `ParleySession::subscribe_speaking()` |
//! | `ModelTextEvent` | `ParleySession::subscribe_text()` |
//!
//! Each channel is a `tokio::sync::broadcast`; a slow subscriber lags and
//! loses old events rather than stalling the session.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

/// Emitted whenever the connection lifecycle changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatusEvent {
    pub status: ConnectionStatus,
    /// Human-readable cause, set for `Error` and for remote or cancelled
    /// closes.
    pub detail: Option<String>,
}

impl ConnectionStatusEvent {
    pub fn new(status: ConnectionStatus) -> Self {
        Self {
            status,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }
}

/// Coarse connection state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Terminal for the conversation. `connect` may start a new one.
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        })
    }
}

// ---------------------------------------------------------------------------
// Speaking state
// ---------------------------------------------------------------------------

/// Emitted when the turn flips between the user and the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakingStateEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub state: SpeakingState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpeakingState {
    /// Microphone open, no model audio queued.
    Listening,
    /// Model audio queued or playing.
    ModelSpeaking,
}

impl std::fmt::Display for SpeakingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SpeakingState::Listening => "listening",
            SpeakingState::ModelSpeaking => "model-speaking",
        })
    }
}

// ---------------------------------------------------------------------------
// Model text
// ---------------------------------------------------------------------------

/// Text parts of the model's turn, when the session is not audio-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTextEvent {
    pub seq: u64,
    pub text: String,
}

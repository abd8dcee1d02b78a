//! # parley-core
//!
//! Duplex real-time voice session SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → input callback → SPSC RingBuffer → capture loop (spawn_blocking)
//!                                                     │ 16 kHz, 4096-sample frames
//!                                                  codec::encode
//!                                                     │
//!                                      OutboundSender → VoiceTransport → network
//!
//! network → VoiceTransport → TransportEvent → session event loop
//!                                                     │
//!                                     PlaybackScheduler (cursor = max(cursor, now))
//!                                                     │
//!                          TimelineControl → TimelineRenderer (output callback) → Speaker
//! ```
//!
//! Audio callbacks never block. All decoding and scheduling happens on the
//! session event loop; all capture-side heap work on the capture thread.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod codec;
pub mod config;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod session;
pub mod transport;

// Convenience re-exports for downstream crates
pub use audio::{
    device::{list_input_devices, list_output_devices, DeviceDirection, DeviceInfo},
    AudioBackend, CpalBackend,
};
pub use codec::{CodecError, DecodedBuffer, EncodedChunk};
pub use config::{AudioConfig, SessionConfig};
pub use error::ParleyError;
pub use ipc::events::{
    ConnectionStatus, ConnectionStatusEvent, ModelTextEvent, SpeakingState, SpeakingStateEvent,
};
pub use session::{diagnostics::DiagnosticsSnapshot, phase::SessionPhase, ParleySession};
pub use transport::{GeminiLiveTransport, TransportEvent, VoiceTransport};

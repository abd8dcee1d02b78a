use thiserror::Error;

use crate::codec::CodecError;

/// All errors produced by parley-core.
#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A pending connect was superseded by a disconnect or dropped.
    #[error("operation cancelled")]
    Cancelled,

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Whether this error belongs to the device family (microphone/speaker).
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            ParleyError::AudioDevice(_)
                | ParleyError::AudioStream(_)
                | ParleyError::NoDefaultInputDevice
                | ParleyError::NoDefaultOutputDevice
        )
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_reads_as_a_plain_reason() {
        assert_eq!(ParleyError::Cancelled.to_string(), "operation cancelled");
        let codec: ParleyError = CodecError::OddByteLength { len: 3 }.into();
        assert!(!codec.is_device_error());
    }

    #[test]
    fn device_family_is_recognised() {
        assert!(ParleyError::NoDefaultOutputDevice.is_device_error());
        assert!(ParleyError::AudioStream("unplugged".into()).is_device_error());
        assert!(!ParleyError::Connect("timeout".into()).is_device_error());
    }
}

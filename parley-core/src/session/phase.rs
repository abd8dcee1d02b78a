//! Session lifecycle as a pure state machine.
//!
//! ```text
//! Idle ─connect─► Connecting ─ready─► Connected(Listening) ⇄ Connected(ModelSpeaking)
//!                     │                        │
//!                     └──fail──► Error ◄──fault┘──close/disconnect──► Disconnected
//! ```

use crate::ipc::events::{ConnectionStatus, SpeakingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaking {
    Listening,
    ModelSpeaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    Connected(Speaking),
    Disconnected,
    Error,
}

/// Inputs that may move the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTrigger {
    Connect,
    /// Devices and transport are both up.
    Ready,
    /// A chunk was decoded and queued.
    AudioScheduled,
    /// The last queued chunk finished playing.
    PlaybackIdle,
    Interrupted,
    /// Local `disconnect()` or a clean remote close.
    Closed,
    /// Device, connect or transport failure.
    Failed,
}

impl SessionPhase {
    /// Next phase for `trigger`. Triggers that make no sense in the current
    /// phase leave it unchanged.
    pub fn apply(self, trigger: PhaseTrigger) -> SessionPhase {
        use PhaseTrigger as T;
        use SessionPhase as P;

        match (self, trigger) {
            (P::Idle | P::Disconnected | P::Error, T::Connect) => P::Connecting,
            (P::Connecting, T::Ready) => P::Connected(Speaking::Listening),
            (P::Connected(_), T::AudioScheduled) => P::Connected(Speaking::ModelSpeaking),
            (P::Connected(Speaking::ModelSpeaking), T::PlaybackIdle | T::Interrupted) => {
                P::Connected(Speaking::Listening)
            }
            (P::Connecting | P::Connected(_), T::Closed) => P::Disconnected,
            (P::Connecting | P::Connected(_), T::Failed) => P::Error,
            (phase, _) => phase,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, SessionPhase::Connected(_))
    }

    /// Whether a conversation is starting or running.
    pub fn is_active(self) -> bool {
        matches!(self, SessionPhase::Connecting | SessionPhase::Connected(_))
    }

    pub fn connection_status(self) -> Option<ConnectionStatus> {
        match self {
            SessionPhase::Idle => None,
            SessionPhase::Connecting => Some(ConnectionStatus::Connecting),
            SessionPhase::Connected(_) => Some(ConnectionStatus::Connected),
            SessionPhase::Disconnected => Some(ConnectionStatus::Disconnected),
            SessionPhase::Error => Some(ConnectionStatus::Error),
        }
    }

    pub fn speaking_state(self) -> Option<SpeakingState> {
        match self {
            SessionPhase::Connected(Speaking::Listening) => Some(SpeakingState::Listening),
            SessionPhase::Connected(Speaking::ModelSpeaking) => Some(SpeakingState::ModelSpeaking),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Connected(Speaking::Listening) => "connected (listening)",
            SessionPhase::Connected(Speaking::ModelSpeaking) => "connected (model speaking)",
            SessionPhase::Disconnected => "disconnected",
            SessionPhase::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PhaseTrigger as T;
    use SessionPhase as P;

    const LISTENING: P = P::Connected(Speaking::Listening);
    const SPEAKING: P = P::Connected(Speaking::ModelSpeaking);

    #[test]
    fn happy_path_turn() {
        let phase = P::Idle
            .apply(T::Connect)
            .apply(T::Ready)
            .apply(T::AudioScheduled);
        assert_eq!(phase, SPEAKING);
        assert_eq!(phase.apply(T::AudioScheduled), SPEAKING);
        assert_eq!(phase.apply(T::PlaybackIdle), LISTENING);
    }

    #[test]
    fn interrupt_returns_to_listening() {
        assert_eq!(SPEAKING.apply(T::Interrupted), LISTENING);
        assert_eq!(LISTENING.apply(T::Interrupted), LISTENING);
    }

    #[test]
    fn failures_and_closes_are_terminal() {
        assert_eq!(P::Connecting.apply(T::Failed), P::Error);
        assert_eq!(SPEAKING.apply(T::Failed), P::Error);
        assert_eq!(LISTENING.apply(T::Closed), P::Disconnected);

        for terminal in [P::Error, P::Disconnected] {
            for trigger in [T::Ready, T::AudioScheduled, T::PlaybackIdle, T::Closed, T::Failed] {
                assert_eq!(terminal.apply(trigger), terminal);
            }
        }
    }

    #[test]
    fn disconnect_from_idle_is_a_no_op() {
        assert_eq!(P::Idle.apply(T::Closed), P::Idle);
        assert_eq!(P::Idle.apply(T::Failed), P::Idle);
    }

    #[test]
    fn a_new_conversation_can_start_after_the_last_one_ended() {
        assert_eq!(P::Error.apply(T::Connect), P::Connecting);
        assert_eq!(P::Disconnected.apply(T::Connect), P::Connecting);
        assert_eq!(LISTENING.apply(T::Connect), LISTENING);
    }

    #[test]
    fn status_mapping() {
        assert_eq!(P::Idle.connection_status(), None);
        assert_eq!(SPEAKING.connection_status(), Some(ConnectionStatus::Connected));
        assert_eq!(SPEAKING.speaking_state(), Some(SpeakingState::ModelSpeaking));
        assert_eq!(P::Error.speaking_state(), None);
    }
}

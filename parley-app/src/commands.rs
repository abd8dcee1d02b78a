//! Prompt command handlers.
//!
//! Each line typed at the prompt parses into a [`Command`]; the handlers
//! below do the work against the shared [`AppState`].

use std::str::FromStr;
use std::time::Instant;

use parley_core::{ConnectionStatus, DeviceInfo};
use tracing::info;

use crate::settings::{normalize_voice, save_settings, KNOWN_VOICES};
use crate::state::{AppState, AppStats};

pub const HELP: &str = "\
commands:
  connect            start a conversation
  disconnect         end the conversation
  status             show the connection status
  devices            list audio devices
  stats              show session counters as JSON
  voice [name]       show or set the response voice (applies on next connect)
  help               show this text
  quit               disconnect and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    Status,
    Devices,
    Stats,
    Voice(Option<String>),
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map(|(w, r)| (w, r.trim()))
            .unwrap_or((line, ""));

        match word.to_ascii_lowercase().as_str() {
            "connect" | "start" => Ok(Command::Connect),
            "disconnect" | "stop" => Ok(Command::Disconnect),
            "status" => Ok(Command::Status),
            "devices" => Ok(Command::Devices),
            "stats" => Ok(Command::Stats),
            "voice" => Ok(Command::Voice(
                Some(rest.to_string()).filter(|r| !r.is_empty()),
            )),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("unknown command `{other}` (try `help`)")),
        }
    }
}

/// Start a conversation with the current settings.
pub async fn connect(state: &AppState) -> Result<(), String> {
    let config = state.settings.lock().session_config();
    let started = Instant::now();
    state
        .session
        .connect(config)
        .await
        .map_err(|e| e.to_string())?;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    state.connect_ms.lock().record(elapsed_ms);
    info!(elapsed_ms, "conversation started");
    Ok(())
}

/// End the conversation, if any.
pub async fn disconnect(state: &AppState) -> Result<(), String> {
    state.session.disconnect().await.map_err(|e| e.to_string())?;
    let stats = state.stats_snapshot();
    info!(
        chunks_sent = stats.session.chunks_sent,
        chunks_received = stats.session.chunks_received,
        interrupts = stats.session.interrupts,
        "session diagnostics on disconnect"
    );
    Ok(())
}

pub fn status(state: &AppState) -> ConnectionStatus {
    state.session.status()
}

pub fn list_devices(state: &AppState) -> (Vec<DeviceInfo>, Vec<DeviceInfo>) {
    (state.session.input_devices(), state.session.output_devices())
}

pub fn stats(state: &AppState) -> AppStats {
    state.stats_snapshot()
}

/// Show the response voice, or set and persist a new one.
pub fn voice(state: &AppState, name: Option<String>) -> Result<String, String> {
    let Some(name) = name else {
        return Ok(state.settings.lock().response_voice.clone());
    };
    let normalized = normalize_voice(&name);
    if !normalized.eq_ignore_ascii_case(name.trim()) {
        return Err(format!(
            "unknown voice `{name}`; known voices: {}",
            KNOWN_VOICES.join(", ")
        ));
    }

    let mut settings = state.settings.lock();
    settings.response_voice = normalized.clone();
    save_settings(&state.settings_path, &settings).map_err(|e| e.to_string())?;
    Ok(normalized)
}

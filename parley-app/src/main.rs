//! Parley terminal host.
//!
//! Loads settings, builds a Gemini Live session over the system audio
//! devices and drives it from a line-oriented prompt on stdin. Status and
//! speaking-state notifications are printed as they arrive.

mod commands;
mod settings;
mod state;

use std::path::PathBuf;
use std::sync::{atomic::Ordering, Arc};

use anyhow::{bail, Context};
use commands::{Command, HELP};
use parley_core::{
    list_input_devices, list_output_devices, DeviceInfo, ParleySession, SpeakingState,
};
use settings::{default_settings_path, load_settings, normalize_voice};
use state::AppState;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const USAGE: &str = "\
usage: parley [options]

options:
  --settings <path>   settings file (default: user data dir)
  --voice <name>      response voice for this run
  --list-devices      print audio devices and exit
  -h, --help          print this text and exit

environment:
  GEMINI_API_KEY / API_KEY   used when the settings file has no apiKey
  RUST_LOG                   log filter (default: parley=info,parley_core=info)";

#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    settings_path: Option<PathBuf>,
    voice: Option<String>,
    list_devices: bool,
    help: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<CliArgs> {
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--settings" => {
                let path = args.next().context("--settings needs a path")?;
                parsed.settings_path = Some(PathBuf::from(path));
            }
            "--voice" => {
                parsed.voice = Some(args.next().context("--voice needs a name")?);
            }
            "--list-devices" => parsed.list_devices = true,
            "-h" | "--help" => parsed.help = true,
            other => bail!("unknown argument `{other}`\n\n{USAGE}"),
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("parley=info,parley_core=info")),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        println!("{USAGE}");
        return Ok(());
    }
    if args.list_devices {
        print_devices(&list_input_devices(), &list_output_devices());
        return Ok(());
    }

    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = args.settings_path.unwrap_or_else(default_settings_path);
    let mut app_settings = load_settings(&settings_path);
    if let Some(voice) = args.voice.as_deref() {
        app_settings.response_voice = normalize_voice(voice);
    }
    info!(
        settings_path = ?settings_path,
        voice = %app_settings.response_voice,
        model = %app_settings.model,
        "settings loaded"
    );

    let api_key = app_settings.resolve_api_key().unwrap_or_default();
    if api_key.is_empty() {
        warn!("no API key configured; set GEMINI_API_KEY or apiKey in {settings_path:?}");
    }

    // ── Session ───────────────────────────────────────────────────────────
    let session = ParleySession::gemini(api_key, app_settings.audio_config());
    let state = Arc::new(AppState::new(session, app_settings, settings_path));
    spawn_event_printers(&state);

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        // EOF
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        match command {
            Command::Connect => {
                // Dropping the connect future unwinds the half-open session.
                let result = tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupted while connecting");
                        break;
                    }
                    result = commands::connect(&state) => result,
                };
                if let Err(e) = result {
                    eprintln!("connect failed: {e}");
                }
            }
            Command::Disconnect => {
                if let Err(e) = commands::disconnect(&state).await {
                    eprintln!("disconnect failed: {e}");
                }
            }
            Command::Status => println!("{}", commands::status(&state)),
            Command::Devices => {
                let (inputs, outputs) = commands::list_devices(&state);
                print_devices(&inputs, &outputs);
            }
            Command::Stats => {
                let stats = commands::stats(&state);
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
            Command::Voice(name) => match commands::voice(&state, name) {
                Ok(voice) => println!("voice: {voice}"),
                Err(e) => eprintln!("{e}"),
            },
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
        }
    }

    commands::disconnect(&state)
        .await
        .map_err(anyhow::Error::msg)?;
    info!("Parley exiting");
    Ok(())
}

/// Print notifications until the session handle is gone.
fn spawn_event_printers(state: &Arc<AppState>) {
    let mut status_rx = state.session.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => match event.detail {
                    Some(detail) => println!("[status] {} ({detail})", event.status),
                    None => println!("[status] {}", event.status),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "status printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut speaking_rx = state.session.subscribe_speaking();
    let turn_state = Arc::clone(state);
    tokio::spawn(async move {
        loop {
            match speaking_rx.recv().await {
                Ok(event) => {
                    if event.state == SpeakingState::ModelSpeaking {
                        turn_state.model_turns.fetch_add(1, Ordering::Relaxed);
                    }
                    println!("[speaking] {}", event.state);
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "speaking printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut text_rx = state.session.subscribe_text();
    tokio::spawn(async move {
        loop {
            match text_rx.recv().await {
                Ok(event) => println!("[model] {}", event.text),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "text printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn print_devices(inputs: &[DeviceInfo], outputs: &[DeviceInfo]) {
    for (title, devices) in [("input", inputs), ("output", outputs)] {
        println!("{title} devices:");
        if devices.is_empty() {
            println!("  (none)");
        }
        for device in devices {
            let mut tags = Vec::new();
            if device.is_default {
                tags.push("default");
            }
            if device.is_recommended {
                tags.push("recommended");
            }
            if device.is_loopback_like {
                tags.push("loopback?");
            }
            if tags.is_empty() {
                println!("  {}", device.name);
            } else {
                println!("  {} [{}]", device.name, tags.join(", "));
            }
        }
    }
}

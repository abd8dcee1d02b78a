//! Persistent host settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};

use parley_core::{
    config::{DEFAULT_MODEL, DEFAULT_VOICE},
    AudioConfig, SessionConfig,
};
use serde::{Deserialize, Serialize};

/// Prebuilt voices the Live API accepts.
pub const KNOWN_VOICES: &[&str] = &["Puck", "Charon", "Kore", "Fenrir", "Aoede"];

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a dedicated Czech language tutor for a Vietnamese student (Level A1-A2).

CORE RULE: BILINGUAL RESPONSE REQUIRED
Every time you speak in Czech, you MUST immediately provide the Vietnamese translation or explanation.

STRUCTURE:
1. Speak the Czech phrase clearly and slightly slowly.
2. Pause briefly.
3. Speak the Vietnamese translation/explanation.

BEHAVIOR:
- Be patient and encouraging.
- If the student makes a mistake, correct them in Czech, then explain the correction in Vietnamese.
- Keep vocabulary simple suitable for A1-A2 level.
- Start the conversation with a bilingual greeting.";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub api_key: Option<String>,
    pub response_voice: String,
    pub system_prompt: String,
    pub audio_only: bool,
    pub model: String,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            response_voice: DEFAULT_VOICE.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            audio_only: true,
            model: DEFAULT_MODEL.into(),
            preferred_input_device: None,
            preferred_output_device: None,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.api_key = trimmed(self.api_key.as_deref());
        self.response_voice = normalize_voice(&self.response_voice);
        if self.system_prompt.trim().is_empty() {
            self.system_prompt = DEFAULT_SYSTEM_PROMPT.into();
        }
        let model = self.model.trim();
        self.model = if model.is_empty() {
            DEFAULT_MODEL.into()
        } else {
            model.trim_start_matches("models/").to_string()
        };
        self.preferred_input_device = trimmed(self.preferred_input_device.as_deref());
        self.preferred_output_device = trimmed(self.preferred_output_device.as_deref());
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            response_voice: self.response_voice.clone(),
            system_prompt: self.system_prompt.clone(),
            audio_only: self.audio_only,
            model: self.model.clone(),
        }
    }

    pub fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            preferred_input_device: self.preferred_input_device.clone(),
            preferred_output_device: self.preferred_output_device.clone(),
            ..AudioConfig::default()
        }
    }

    /// Key from the settings file, else `GEMINI_API_KEY`, else `API_KEY`.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            ["GEMINI_API_KEY", "API_KEY"]
                .iter()
                .find_map(|var| trimmed(std::env::var(var).ok().as_deref()))
        })
    }
}

/// Case-insensitive match against [`KNOWN_VOICES`]; unknown names fall back
/// to the default voice.
pub fn normalize_voice(raw: &str) -> String {
    let raw = raw.trim();
    KNOWN_VOICES
        .iter()
        .find(|v| v.eq_ignore_ascii_case(raw))
        .copied()
        .unwrap_or(DEFAULT_VOICE)
        .to_string()
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("Parley")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("parley")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_names_are_canonicalized() {
        assert_eq!(normalize_voice(" kore "), "Kore");
        assert_eq!(normalize_voice("AOEDE"), "Aoede");
        assert_eq!(normalize_voice("Robot"), "Fenrir");
        assert_eq!(normalize_voice(""), "Fenrir");
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let mut settings: AppSettings =
            serde_json::from_str(r#"{"responseVoice":"puck","preferredInputDevice":"  "}"#)
                .unwrap();
        settings.normalize();
        assert_eq!(settings.response_voice, "Puck");
        assert_eq!(settings.preferred_input_device, None);
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert!(settings.system_prompt.starts_with("You are a dedicated Czech"));
        assert!(settings.audio_only);
    }

    #[test]
    fn blank_prompt_and_prefixed_model_are_normalized() {
        let mut settings = AppSettings {
            system_prompt: "   ".into(),
            model: " models/gemini-live ".into(),
            api_key: Some("  ".into()),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(settings.model, "gemini-live");
        assert_eq!(settings.api_key, None);
    }

    #[test]
    fn settings_survive_a_save_load_cycle() {
        let dir = std::env::temp_dir().join(format!("parley-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = AppSettings {
            response_voice: "Charon".into(),
            preferred_output_device: Some("USB Headset".into()),
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();

        let loaded = load_settings(&path);
        assert_eq!(loaded.response_voice, "Charon");
        assert_eq!(loaded.preferred_output_device.as_deref(), Some("USB Headset"));
        assert_eq!(loaded.audio_config().preferred_output_device.as_deref(), Some("USB Headset"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = load_settings(Path::new("/nonexistent/parley/settings.json"));
        assert_eq!(settings.response_voice, DEFAULT_VOICE);
        assert_eq!(settings.session_config().response_voice, DEFAULT_VOICE);
    }
}

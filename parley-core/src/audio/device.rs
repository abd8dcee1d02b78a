//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

/// Which side of the conversation a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
    /// Heuristic flag for inputs that likely capture system/output audio.
    /// Such a "microphone" would feed the model its own voice back.
    pub is_loopback_like: bool,
    /// Heuristic recommendation for the best device in this direction.
    pub is_recommended: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "speakers (",
    "headphones (",
];

const MIC_POSITIVE_KEYWORDS: &[&str] = &[
    "microphone",
    "mic",
    "array",
    "headset",
    "input",
    "usb",
    "webcam",
];

const SPEAKER_POSITIVE_KEYWORDS: &[&str] = &["speaker", "headphone", "headset", "output"];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score a device name for how likely it is the right choice for `direction`.
///
/// Higher is better.
pub fn preference_score(name: &str, direction: DeviceDirection) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = 0;
    match direction {
        DeviceDirection::Input => {
            score += if is_loopback_like_name(&lowered) { -16 } else { 8 };
            if MIC_POSITIVE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
                score += 6;
            }
        }
        DeviceDirection::Output => {
            if SPEAKER_POSITIVE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
                score += 6;
            }
            if lowered.contains("hdmi") || lowered.contains("displayport") {
                score -= 4;
            }
        }
    }
    if lowered.contains("default") {
        score += 1;
    }
    score
}

/// Mark the best-scoring device recommended and sort recommended-first.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn rank(mut list: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
    if let Some((idx, _)) = list.iter().enumerate().max_by_key(|(_, d)| {
        preference_score(&d.name, d.direction) + if d.is_default { 2 } else { 0 }
    }) {
        list[idx].is_recommended = true;
    }

    list.sort_by_key(|d| {
        (
            !d.is_recommended,
            d.is_loopback_like,
            !d.is_default,
            d.name.to_ascii_lowercase(),
        )
    });
    list
}

/// List available microphones, best candidate first.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    list_devices(DeviceDirection::Input)
}

/// List available speakers/headphones, best candidate first.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    list_devices(DeviceDirection::Output)
}

#[cfg(feature = "audio-cpal")]
fn list_devices(direction: DeviceDirection) -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let (default_name, devices) = match direction {
        DeviceDirection::Input => (
            host.default_input_device().and_then(|d| d.name().ok()),
            host.input_devices().map(|d| d.collect::<Vec<_>>()),
        ),
        DeviceDirection::Output => (
            host.default_output_device().and_then(|d| d.name().ok()),
            host.output_devices().map(|d| d.collect::<Vec<_>>()),
        ),
    };

    let devices = match devices {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!(?direction, "failed to enumerate devices: {e}");
            return default_name
                .map(|name| {
                    vec![DeviceInfo {
                        is_loopback_like: direction == DeviceDirection::Input
                            && is_loopback_like_name(&name),
                        name,
                        direction,
                        is_default: true,
                        is_recommended: true,
                    }]
                })
                .unwrap_or_default();
        }
    };

    let list = devices
        .iter()
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Device {}", idx + 1));
            DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                is_loopback_like: direction == DeviceDirection::Input
                    && is_loopback_like_name(&name),
                name,
                direction,
                is_recommended: false,
            }
        })
        .collect::<Vec<_>>();

    rank(list)
}

/// Resolve a device: preferred name, then system default, then first available.
#[cfg(feature = "audio-cpal")]
pub(crate) fn select_device(
    direction: DeviceDirection,
    preferred_name: Option<&str>,
) -> crate::error::Result<cpal::Device> {
    use crate::error::ParleyError;
    use cpal::traits::{DeviceTrait, HostTrait};
    use tracing::warn;

    let host = cpal::default_host();
    let enumerate = || match direction {
        DeviceDirection::Input => host.input_devices().map(|d| d.collect::<Vec<_>>()),
        DeviceDirection::Output => host.output_devices().map(|d| d.collect::<Vec<_>>()),
    };

    if let Some(preferred) = preferred_name {
        match enumerate() {
            Ok(devices) => {
                if let Some(device) = devices
                    .into_iter()
                    .find(|d| d.name().map(|n| n == preferred).unwrap_or(false))
                {
                    return Ok(device);
                }
                warn!(?direction, "preferred device '{preferred}' not found, falling back");
            }
            Err(e) => warn!(?direction, "failed to list devices while resolving preference: {e}"),
        }
    }

    let default = match direction {
        DeviceDirection::Input => host.default_input_device(),
        DeviceDirection::Output => host.default_output_device(),
    };
    if let Some(device) = default {
        return Ok(device);
    }

    let missing = match direction {
        DeviceDirection::Input => ParleyError::NoDefaultInputDevice,
        DeviceDirection::Output => ParleyError::NoDefaultOutputDevice,
    };
    let fallback = enumerate()
        .map_err(|e| ParleyError::AudioDevice(e.to_string()))?
        .into_iter()
        .next()
        .ok_or(missing)?;
    warn!(?direction, "no default device, falling back to first available");
    Ok(fallback)
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, direction: DeviceDirection, is_default: bool) -> DeviceInfo {
        DeviceInfo {
            name: name.into(),
            direction,
            is_default,
            is_loopback_like: direction == DeviceDirection::Input && is_loopback_like_name(name),
            is_recommended: false,
        }
    }

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(!is_loopback_like_name("USB Microphone"));
    }

    #[test]
    fn scores_mic_higher_than_loopback() {
        let mic = preference_score("Microphone Array (USB PnP Audio Device)", DeviceDirection::Input);
        let loopback = preference_score("Stereo Mix (Realtek Audio)", DeviceDirection::Input);
        assert!(mic > loopback);
    }

    #[test]
    fn ranking_puts_the_real_microphone_first() {
        let ranked = rank(vec![
            info("Stereo Mix (Realtek Audio)", DeviceDirection::Input, true),
            info("Headset Microphone", DeviceDirection::Input, false),
        ]);
        assert_eq!(ranked[0].name, "Headset Microphone");
        assert!(ranked[0].is_recommended);
        assert!(!ranked[1].is_recommended);
    }

    #[test]
    fn ranking_prefers_speakers_over_hdmi() {
        let ranked = rank(vec![
            info("HDMI Output (NVIDIA)", DeviceDirection::Output, false),
            info("Built-in Speakers", DeviceDirection::Output, false),
        ]);
        assert_eq!(ranked[0].name, "Built-in Speakers");
    }
}

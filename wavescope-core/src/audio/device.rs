//! Audio input device enumeration and identifier matching.

use serde::{Deserialize, Serialize};

/// Metadata about an audio input device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default input device.
    pub is_default: bool,
}

/// Whether `name` matches a user-supplied device identifier: exact match
/// first, then a case-insensitive description substring.
pub fn matches_identifier(name: &str, identifier: &str) -> bool {
    if name == identifier {
        return true;
    }
    let name = name.trim().to_ascii_lowercase();
    let identifier = identifier.trim().to_ascii_lowercase();
    !identifier.is_empty() && name.contains(&identifier)
}

/// List all available audio input devices on the system.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                let is_default = default_name.as_deref() == Some(name.as_str());
                DeviceInfo { name, is_default }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            if let Some(default) = host.default_input_device() {
                let name = default
                    .name()
                    .unwrap_or_else(|_| "Default Input Device".to_string());
                vec![DeviceInfo {
                    name,
                    is_default: true,
                }]
            } else {
                vec![]
            }
        }
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::matches_identifier;

    #[test]
    fn exact_name_matches() {
        assert!(matches_identifier("USB Audio Device", "USB Audio Device"));
    }

    #[test]
    fn description_substring_matches_case_insensitively() {
        assert!(matches_identifier(
            "Microphone Array (Realtek Audio)",
            "realtek"
        ));
        assert!(matches_identifier("Scarlett 2i2 USB", "scarlett 2i2"));
    }

    #[test]
    fn empty_identifier_never_matches() {
        assert!(!matches_identifier("Anything", ""));
        assert!(!matches_identifier("Anything", "   "));
    }

    #[test]
    fn unrelated_names_do_not_match() {
        assert!(!matches_identifier("Built-in Microphone", "usb"));
    }
}

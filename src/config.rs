//! Session configuration
//!
//! All tuning knobs are plain values handed to the components at
//! construction time. The core only reads configuration; loading and
//! persisting it is the embedding application's job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_VAD_HANG_MS, DEFAULT_VAD_THRESHOLD_DB};
use crate::error::Error;

/// Duplex policy for the audio path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplexPolicy {
    /// Microphone and speaker stay open concurrently; only gates toggle
    Full,
    /// Transmit and receive paths may never hold their devices open at
    /// the same time; every transmit edge switches the hardware over
    Half,
}

/// Manual keying gesture interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PttMode {
    /// Key is active while held down
    Hold,
    /// Each press flips the key state
    Toggle,
}

/// Voice activity detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Whether automatic voice keying participates in the transmit decision
    pub enabled: bool,
    /// Activation threshold in dB, clamped to [-60, 0]
    pub threshold_db: i32,
    /// Hang time in milliseconds before dropping back to idle
    pub hang_ms: u64,
}

impl VadConfig {
    /// Hang time as a [`Duration`]
    pub fn hang_delay(&self) -> Duration {
        Duration::from_millis(self.hang_ms)
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_db: DEFAULT_VAD_THRESHOLD_DB,
            hang_ms: DEFAULT_VAD_HANG_MS,
        }
    }
}

/// Complete session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Audio path duplex policy
    pub duplex: DuplexPolicy,
    /// Manual key gesture mode
    pub ptt_mode: PttMode,
    /// Voice activity detector settings
    pub vad: VadConfig,
    /// Microphone device name; `None` selects the host default
    pub mic_device: Option<String>,
    /// Speaker device name; `None` selects the host default
    pub speaker_device: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            duplex: DuplexPolicy::Half,
            ptt_mode: PttMode::Hold,
            vad: VadConfig::default(),
            mic_device: None,
            speaker_device: None,
        }
    }
}

impl LinkConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.duplex, DuplexPolicy::Half);
        assert_eq!(config.ptt_mode, PttMode::Hold);
        assert!(!config.vad.enabled);
        assert_eq!(config.vad.threshold_db, -30);
        assert_eq!(config.vad.hang_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_parse_toml() {
        let config = LinkConfig::from_toml_str(
            r#"
            duplex = "full"
            ptt_mode = "toggle"
            mic_device = "USB Audio"

            [vad]
            enabled = true
            threshold_db = -25
            hang_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.duplex, DuplexPolicy::Full);
        assert_eq!(config.ptt_mode, PttMode::Toggle);
        assert_eq!(config.mic_device.as_deref(), Some("USB Audio"));
        assert!(config.vad.enabled);
        assert_eq!(config.vad.threshold_db, -25);
        assert_eq!(config.vad.hang_ms, 500);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = LinkConfig::from_toml_str("duplex = \"full\"").unwrap();
        assert_eq!(config.duplex, DuplexPolicy::Full);
        assert_eq!(config.ptt_mode, PttMode::Hold);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let result = LinkConfig::from_toml_str("duplex = \"simplex\"");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

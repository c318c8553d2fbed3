use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::HfpError;

/// Contents of `~/.config/hfp-bridge/config.toml`
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Phone MAC, e.g. "AA:BB:CC:DD:EE:FF". When unset the first paired and
    /// connected device reported by bluetoothctl is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Fixed RFCOMM channel; skips SDP discovery when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u8>,

    /// `name,number` file used to resolve caller names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contacts: Option<PathBuf>,

    /// PulseAudio server, e.g. "unix:/run/user/1000/pulse/native". Unset
    /// uses the default server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse_server: Option<String>,

    #[serde(default)]
    pub aec: AecSettings,

    #[serde(default)]
    pub timing: Timing,
}

/// Echo cancellation policy.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AecSettings {
    /// Operator kill switch. On by default: the canceller can produce
    /// robotic artifacts on some speaker/mic setups.
    pub force_disable: bool,
    /// Echo tail covered by the adaptive filter.
    pub tail_ms: u32,
    /// NLMS step size (0, 1].
    pub step_size: f32,
}

impl Default for AecSettings {
    fn default() -> Self {
        Self {
            force_disable: true,
            tail_ms: 64,
            step_size: 0.3,
        }
    }
}

/// Timeouts and settle delays, in milliseconds.
///
/// Phones answer AT commands slowly and inconsistently; reads return as soon
/// as a final result code arrives, so these are upper bounds.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Timing {
    pub at_response_ms: u64,
    pub dial_response_ms: u64,
    pub command_response_ms: u64,
    pub pause_settle_ms: u64,
    pub listener_poll_ms: u64,
    pub sco_grace_ms: u64,
    pub sco_release_wait_ms: u64,
    pub sco_busy_retry_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            at_response_ms: 1000,
            dial_response_ms: 1000,
            command_response_ms: 200,
            pause_settle_ms: 150,
            listener_poll_ms: 1000,
            sco_grace_ms: 50,
            sco_release_wait_ms: 500,
            sco_busy_retry_ms: 200,
            join_timeout_ms: 1000,
        }
    }
}

impl Timing {
    pub fn at_response(&self) -> Duration { Duration::from_millis(self.at_response_ms) }
    pub fn dial_response(&self) -> Duration { Duration::from_millis(self.dial_response_ms) }
    pub fn command_response(&self) -> Duration { Duration::from_millis(self.command_response_ms) }
    pub fn pause_settle(&self) -> Duration { Duration::from_millis(self.pause_settle_ms) }
    pub fn listener_poll(&self) -> Duration { Duration::from_millis(self.listener_poll_ms) }
    pub fn sco_grace(&self) -> Duration { Duration::from_millis(self.sco_grace_ms) }
    pub fn sco_release_wait(&self) -> Duration { Duration::from_millis(self.sco_release_wait_ms) }
    pub fn sco_busy_retry(&self) -> Duration { Duration::from_millis(self.sco_busy_retry_ms) }
    pub fn join_timeout(&self) -> Duration { Duration::from_millis(self.join_timeout_ms) }

    /// Near-zero delays for tests against in-memory fakes.
    pub fn immediate() -> Self {
        Self {
            at_response_ms: 200,
            dial_response_ms: 200,
            command_response_ms: 100,
            pause_settle_ms: 0,
            listener_poll_ms: 20,
            sco_grace_ms: 0,
            sco_release_wait_ms: 100,
            sco_busy_retry_ms: 0,
            join_timeout_ms: 500,
        }
    }
}

impl Config {
    // ── Paths ─────────────────────────────────────────────────────────────────

    /// Returns the path to the config file.
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hfp-bridge")
            .join("config.toml")
    }

    // ── Load ──────────────────────────────────────────────────────────────────

    /// Load and parse the config file at the standard path.
    /// Returns [HfpError::ConfigNotFound] with the expected path if missing.
    pub fn load() -> Result<Self, HfpError> {
        Self::load_from(&Self::path())
    }

    /// Load and parse the config file at `path`.
    pub fn load_from(path: &Path) -> Result<Self, HfpError> {
        if !path.exists() {
            return Err(HfpError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let raw = fs::read_to_string(path).map_err(HfpError::ConfigRead)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, HfpError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::path);
        match Self::load_from(&path) {
            Err(HfpError::ConfigNotFound { .. }) => Ok(Self::default()),
            other => other,
        }
    }

    // ── Init / Save ────────────────────────────────────────────────────────────

    /// Write the default config file to the standard path.
    /// Creates parent directories if they don't exist.
    pub fn write_default() -> Result<PathBuf, HfpError> {
        let path = Self::path();
        Self::default().save_to(&path)?;
        Ok(path)
    }

    /// Persist the current state back to the config file.
    pub fn save(&self) -> Result<(), HfpError> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), HfpError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(HfpError::ConfigRead)?;
        }
        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).map_err(HfpError::ConfigRead)?;
        Ok(())
    }

    /// Validate field contents that serde cannot check.
    pub fn validate(&self) -> Result<(), HfpError> {
        if let Some(device) = &self.device {
            crate::bluetooth::BdAddr::parse(device)?;
        }
        if self.channel == Some(0) || self.channel.is_some_and(|c| c > 30) {
            return Err(HfpError::InvalidConfig(format!(
                "channel {} out of range 1..=30",
                self.channel.unwrap_or(0)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_disable_aec() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.aec.force_disable);
        assert_eq!(config.timing.listener_poll_ms, 1000);
        assert!(config.device.is_none());
    }

    #[test]
    fn partial_sections_fill_in_defaults() {
        let raw = r#"
            device = "AA:BB:CC:DD:EE:FF"
            channel = 5
            pulse_server = "tcp:localhost"

            [aec]
            force_disable = false

            [timing]
            dial_response_ms = 2500
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.channel, Some(5));
        assert_eq!(config.pulse_server.as_deref(), Some("tcp:localhost"));
        assert!(!config.aec.force_disable);
        assert_eq!(config.aec.tail_ms, 64);
        assert_eq!(config.timing.dial_response_ms, 2500);
        assert_eq!(config.timing.at_response_ms, 1000);
        config.validate().unwrap();
    }

    #[test]
    fn save_then_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config {
            device: Some("11:22:33:44:55:66".into()),
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.device.as_deref(), Some("11:22:33:44:55:66"));
    }

    #[test]
    fn missing_file_is_reported_or_defaulted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            Config::load_from(&path),
            Err(HfpError::ConfigNotFound { .. })
        ));
        let config = Config::load_or_default(Some(&path)).unwrap();
        assert!(config.device.is_none());
    }

    #[test]
    fn bad_device_address_is_rejected() {
        let config = Config {
            device: Some("not-a-mac".into()),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(HfpError::InvalidAddress(_))));
    }
}

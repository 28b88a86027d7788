//! `Config`/`SettingsManager` (SPEC_FULL.md §2): serde-derived settings
//! sections, JSON/TOML load and save, and platform-specific config
//! directory resolution.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use coppercli_core::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// `Some(path)` to connect over serial on startup; `None` leaves the
    /// driver disconnected until something else connects it.
    pub serial_port: Option<String>,
    pub baud_rate: u32,
    pub dtr: bool,
    pub tcp_address: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            serial_port: None,
            baud_rate: 115_200,
            dtr: true,
            tcp_address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineSettings {
    pub controller_buffer_size: usize,
    pub status_poll_interval_ms: u64,
    pub min_grbl_version: String,
    pub homing_timeout_secs: u64,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            controller_buffer_size: 128,
            status_poll_interval_ms: 200,
            min_grbl_version: "1.1f".into(),
            homing_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    pub grid_margin: f64,
    pub grid_step: f64,
    pub x_axis_weight: f64,
    pub abort_on_fail: bool,
    pub slow_probe_threshold: f64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            grid_margin: 5.0,
            grid_step: 10.0,
            x_axis_weight: 1.0,
            abort_on_fail: true,
            slow_probe_threshold: 1.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MillingSettings {
    pub mill_start_safety_z: f64,
    pub mill_complete_z: f64,
    pub clearance_z: f64,
}

impl Default for MillingSettings {
    fn default() -> Self {
        Self {
            mill_start_safety_z: -1.0,
            mill_complete_z: -5.0,
            clearance_z: -1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    pub enabled: bool,
    pub listen_addr: String,
    pub heartbeat_interval_secs: u64,
    pub max_missed_heartbeats: u32,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "0.0.0.0:2323".into(),
            heartbeat_interval_secs: 10,
            max_missed_heartbeats: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub connection: ConnectionSettings,
    pub machine: MachineSettings,
    pub probe: ProbeSettings,
    pub milling: MillingSettings,
    pub proxy: ProxySettings,
}

impl Config {
    /// Reject non-positive timeouts/limits that would otherwise silently
    /// produce a stuck or busy-looping runtime.
    pub fn validate(&self) -> Result<(), Error> {
        if self.machine.controller_buffer_size == 0 {
            return Err(Error::other("machine.controller_buffer_size must be positive"));
        }
        if self.machine.status_poll_interval_ms == 0 {
            return Err(Error::other("machine.status_poll_interval_ms must be positive"));
        }
        if self.machine.homing_timeout_secs == 0 {
            return Err(Error::other("machine.homing_timeout_secs must be positive"));
        }
        if self.probe.grid_step <= 0.0 {
            return Err(Error::other("probe.grid_step must be positive"));
        }
        if self.proxy.enabled && self.proxy.max_missed_heartbeats == 0 {
            return Err(Error::other("proxy.max_missed_heartbeats must be positive"));
        }
        Ok(())
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.machine.status_poll_interval_ms)
    }

    pub fn homing_timeout(&self) -> Duration {
        Duration::from_secs(self.machine.homing_timeout_secs)
    }
}

/// Loads and saves a [`Config`] from the platform config directory, the way
/// the source project resolves a per-OS settings path.
pub struct SettingsManager {
    path: PathBuf,
}

impl SettingsManager {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `<config dir>/coppercli/config.toml`: `%APPDATA%` on Windows,
    /// `~/Library/Application Support` on macOS, `$XDG_CONFIG_HOME` (or
    /// `~/.config`) elsewhere.
    pub fn default_path() -> PathBuf {
        Self::platform_config_dir().join("coppercli").join("config.toml")
    }

    #[cfg(target_os = "windows")]
    fn platform_config_dir() -> PathBuf {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    #[cfg(target_os = "macos")]
    fn platform_config_dir() -> PathBuf {
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join("Library/Application Support"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    fn platform_config_dir() -> PathBuf {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Loads the config at `self.path`, falling back to (and persisting) a
    /// default configuration if the file does not exist yet.
    pub fn load(&self) -> Result<Config, Error> {
        if !self.path.exists() {
            let config = Config::default();
            self.save(&config)?;
            return Ok(config);
        }
        let text = std::fs::read_to_string(&self.path)?;
        let config: Config = toml::from_str(&text).map_err(|e| Error::other(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config: &Config) -> Result<(), Error> {
        config.validate()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(config).map_err(|e| Error::other(e.to_string()))?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let mut config = Config::default();
        config.machine.status_poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_creates_a_default_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SettingsManager::new(dir.path().join("config.toml"));
        let config = manager.load().unwrap();
        assert_eq!(config.machine.controller_buffer_size, 128);
        assert!(manager.path().exists());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SettingsManager::new(dir.path().join("config.toml"));
        let mut config = Config::default();
        config.connection.serial_port = Some("/dev/ttyUSB0".into());
        manager.save(&config).unwrap();
        let loaded = manager.load().unwrap();
        assert_eq!(loaded.connection.serial_port.as_deref(), Some("/dev/ttyUSB0"));
    }
}

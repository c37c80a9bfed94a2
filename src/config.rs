// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Configuration file handling.
//!
//! Persists daemon settings, verification tuning, hwmon channel bindings and
//! the user preset list to TOML.
//! Default path: `/etc/fanctl/config.toml`

use crate::error::{Error, Result};
use crate::preset::{Preset, PresetRepository};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fanctl/config.toml";

/// Default daemon socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/fanctl.sock";

/// Default poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Sampling and tolerance settings for duty verification.
    #[serde(default)]
    pub verification: VerificationConfig,

    /// Fan channels in index order.
    #[serde(default)]
    pub channels: Vec<ChannelBinding>,

    /// User presets. Built-in presets are never written here.
    #[serde(default)]
    pub presets: Vec<Preset>,
}

/// Daemon-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Poll interval for the curve engine, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Path for the Unix domain socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// Whether to restore fans to automatic on daemon exit.
    #[serde(default = "default_true")]
    pub restore_on_exit: bool,

    /// Preset applied at startup (defaults to Auto).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_preset: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            restore_on_exit: true,
            active_preset: None,
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }
}

/// Verification tuning.
///
/// A sampling round reads RPM `sample_count` times, `sample_delay_ms` apart.
/// The round is stable when `max - min` is within `tolerance_percent` of the
/// average or within `min_tolerance_rpm`, whichever is larger. Unstable
/// rounds are repeated up to `max_retries` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub sample_count: usize,
    /// Upper bound for client-requested sample counts.
    pub max_sample_count: usize,
    pub sample_delay_ms: u64,
    /// Wait after the write before the first read.
    pub settle_delay_ms: u64,
    pub tolerance_percent: f64,
    pub min_tolerance_rpm: u32,
    pub max_retries: u32,
    pub history_limit: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            sample_count: 3,
            max_sample_count: 100,
            sample_delay_ms: 500,
            settle_delay_ms: 1500,
            tolerance_percent: 5.0,
            min_tolerance_rpm: 50,
            max_retries: 2,
            history_limit: 100,
        }
    }
}

impl VerificationConfig {
    pub fn sample_delay(&self) -> Duration {
        Duration::from_millis(self.sample_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// One fan channel: a PWM output and the temperature sensor that drives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBinding {
    /// hwmon fan id, e.g. "hwmon3/pwm1"
    pub fan_id: String,
    /// hwmon temperature sensor id, e.g. "hwmon3/temp1"
    pub temp_sensor_id: String,
}

// ---------------------------------------------------------------------------
// Load / Save
// ---------------------------------------------------------------------------

/// Load config from a TOML file, or return the default if the file doesn't exist.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        log::info!("No config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path).map_err(|source| Error::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| Error::Parse {
        what: path.display().to_string(),
        reason: e.to_string(),
    })?;

    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Save config to a TOML file, creating parent directories if needed.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let write_err = |source| Error::FileWrite {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let contents = toml::to_string_pretty(config).map_err(|e| Error::Serialize {
        what: "config".to_string(),
        reason: e.to_string(),
    })?;

    fs::write(path, contents).map_err(write_err)?;
    log::info!("Saved config to {}", path.display());
    Ok(())
}

/// Resolve the config file path from CLI arg or default.
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    cli_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

// ---------------------------------------------------------------------------
// Preset persistence
// ---------------------------------------------------------------------------

/// Stores user presets in the `presets` list of the config file, leaving
/// every other setting as it is on disk.
pub struct ConfigFile {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    io: Mutex<()>,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io: Mutex::new(()),
        }
    }
}

impl PresetRepository for ConfigFile {
    fn load_presets(&self) -> Result<Vec<Preset>> {
        let _io = self.io.lock().unwrap_or_else(|e| e.into_inner());
        Ok(load_config(&self.path)?.presets)
    }

    fn store_presets(&self, presets: &[Preset]) -> Result<()> {
        let _io = self.io.lock().unwrap_or_else(|e| e.into_inner());
        let mut config = load_config(&self.path)?;
        config.presets = presets.iter().filter(|p| !p.is_built_in).cloned().collect();
        save_config(&self.path, &config)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::{CurvePoint, FanCurve};
    use crate::preset::{ControlMode, PresetStore};
    use std::sync::Arc;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.daemon.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.verification, VerificationConfig::default());
        assert!(config.presets.is_empty());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[daemon]
poll_interval_ms = 1000

[verification]
sample_count = 5

[[channels]]
fan_id = "hwmon2/pwm1"
temp_sensor_id = "hwmon2/temp1"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.daemon.poll_interval_ms, 1000);
        assert!(config.daemon.restore_on_exit);
        assert_eq!(config.verification.sample_count, 5);
        assert_eq!(config.verification.max_retries, 2);
        assert_eq!(config.channels[0].fan_id, "hwmon2/pwm1");
    }

    #[test]
    fn test_parse_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[daemon\npoll_interval_ms = ").unwrap();
        assert!(matches!(load_config(&path), Err(Error::Parse { .. })));
    }

    #[test]
    fn test_store_presets_keeps_other_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fanctl").join("config.toml");
        let mut config = Config::default();
        config.daemon.poll_interval_ms = 750;
        config.channels.push(ChannelBinding {
            fan_id: "hwmon1/pwm1".to_string(),
            temp_sensor_id: "hwmon1/temp1".to_string(),
        });
        save_config(&path, &config).unwrap();

        let repo = ConfigFile::new(&path);
        let curve = FanCurve::new(vec![CurvePoint::new(40.0, 20), CurvePoint::new(80.0, 90)]).unwrap();
        repo.store_presets(&[Preset::new("Work", ControlMode::Manual, curve), Preset::auto()])
            .unwrap();

        let reloaded = load_config(&path).unwrap();
        assert_eq!(reloaded.daemon.poll_interval_ms, 750);
        assert_eq!(reloaded.channels.len(), 1);
        assert_eq!(reloaded.presets.len(), 1);
        assert_eq!(reloaded.presets[0].name, "Work");
    }

    #[test]
    fn test_store_round_trip_through_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let curve = FanCurve::new(vec![CurvePoint::new(35.5, 15), CurvePoint::new(85.0, 100)]).unwrap();

        let store = PresetStore::new(Arc::new(ConfigFile::new(&path)));
        store
            .save(Preset::new("Travel", ControlMode::Manual, curve.clone()))
            .unwrap();

        let fresh = PresetStore::new(Arc::new(ConfigFile::new(&path)));
        assert_eq!(fresh.load_from_persistent_store().unwrap(), 1);
        let travel = fresh.get("travel").unwrap();
        assert_eq!(travel.curve, curve);
        assert!(!travel.is_built_in);
    }
}

// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! hwmon sysfs discovery and control.
//!
//! Scans `/sys/class/hwmon/` for fan and temperature sensor entries and
//! exposes configured fan/sensor pairs as [`FanHardware`] channels. Duty is
//! converted between percent and the 0-255 `pwmN` scale; the level reported
//! back is the `pwmN` value read from sysfs, converted to percent.

use crate::config::ChannelBinding;
use crate::error::{Error, Result};
use crate::hardware::{FanHardware, FanState};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub const HWMON_ROOT: &str = "/sys/class/hwmon";

const PWM_MAX: f64 = 255.0;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A discovered fan (PWM output + optional tachometer input).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fan {
    /// Unique identifier, e.g. "hwmon3/pwm1"
    pub id: String,
    /// Human-readable label if available
    pub label: Option<String>,
    /// Absolute path to the `pwmN` file
    pub pwm_path: PathBuf,
    /// Absolute path to the `pwmN_enable` file
    pub pwm_enable_path: PathBuf,
    /// Absolute path to the `fanN_input` file (RPM), if present
    pub rpm_path: Option<PathBuf>,
    /// Name of the parent hwmon device
    pub hwmon_name: String,
}

/// A discovered temperature sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempSensor {
    /// Unique identifier, e.g. "hwmon3/temp1"
    pub id: String,
    /// Human-readable label if available
    pub label: Option<String>,
    /// Absolute path to the `tempN_input` file (millidegrees C)
    pub input_path: PathBuf,
    /// Name of the parent hwmon device
    pub hwmon_name: String,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Scan `root` (normally [`HWMON_ROOT`]) and return all discovered fans.
pub fn discover_fans(root: &Path) -> io::Result<Vec<Fan>> {
    let mut fans = Vec::new();

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let hwmon_dir = entry.path();
        let hwmon_name = read_trimmed(&hwmon_dir.join("name")).unwrap_or_default();
        let hwmon_basename = entry.file_name().to_string_lossy().to_string();

        // Look for pwmN files (N = 1, 2, 3, ...)
        for n in 1..=16 {
            let pwm_path = hwmon_dir.join(format!("pwm{n}"));
            let pwm_enable_path = hwmon_dir.join(format!("pwm{n}_enable"));

            if !pwm_path.exists() {
                break;
            }

            let rpm_path = Some(hwmon_dir.join(format!("fan{n}_input"))).filter(|p| p.exists());

            fans.push(Fan {
                id: format!("{hwmon_basename}/pwm{n}"),
                label: read_trimmed(&hwmon_dir.join(format!("fan{n}_label"))),
                pwm_path,
                pwm_enable_path,
                rpm_path,
                hwmon_name: hwmon_name.clone(),
            });
        }
    }

    fans.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(fans)
}

/// Scan `root` (normally [`HWMON_ROOT`]) and return all temperature sensors.
pub fn discover_temp_sensors(root: &Path) -> io::Result<Vec<TempSensor>> {
    let mut sensors = Vec::new();

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let hwmon_dir = entry.path();
        let hwmon_name = read_trimmed(&hwmon_dir.join("name")).unwrap_or_default();
        let hwmon_basename = entry.file_name().to_string_lossy().to_string();

        for n in 1..=32 {
            let input_path = hwmon_dir.join(format!("temp{n}_input"));

            if !input_path.exists() {
                break;
            }

            sensors.push(TempSensor {
                id: format!("{hwmon_basename}/temp{n}"),
                label: read_trimmed(&hwmon_dir.join(format!("temp{n}_label"))),
                input_path,
                hwmon_name: hwmon_name.clone(),
            });
        }
    }

    sensors.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(sensors)
}

/// Pair every fan with a sensor on the same hwmon device, or with the first
/// sensor found when its device has none.
pub fn default_bindings(fans: &[Fan], sensors: &[TempSensor]) -> Vec<ChannelBinding> {
    let Some(fallback) = sensors.first() else {
        return Vec::new();
    };

    fans.iter()
        .map(|fan| {
            let device = fan.id.split('/').next().unwrap_or_default();
            let sensor = sensors
                .iter()
                .find(|s| s.id.split('/').next() == Some(device))
                .unwrap_or(fallback);
            ChannelBinding {
                fan_id: fan.id.clone(),
                temp_sensor_id: sensor.id.clone(),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

pub fn percent_to_pwm(percent: u8) -> u8 {
    (percent.min(100) as f64 * PWM_MAX / 100.0).round() as u8
}

pub fn pwm_to_percent(pwm: u8) -> u8 {
    (pwm as f64 * 100.0 / PWM_MAX).round() as u8
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

struct HwmonChannel {
    fan: Fan,
    sensor: TempSensor,
    manual: AtomicBool,
}

/// Configured hwmon fan/sensor pairs, indexed in binding order.
pub struct HwmonBackend {
    channels: Vec<HwmonChannel>,
}

impl HwmonBackend {
    /// Resolve each binding against the discovered fans and sensors.
    pub fn from_bindings(
        bindings: &[ChannelBinding],
        fans: &[Fan],
        sensors: &[TempSensor],
    ) -> Result<Self> {
        let mut channels = Vec::with_capacity(bindings.len());

        for (index, binding) in bindings.iter().enumerate() {
            let fan = fans
                .iter()
                .find(|f| f.id == binding.fan_id)
                .ok_or_else(|| Error::hardware(index, format!("unknown fan {}", binding.fan_id)))?;
            let sensor = sensors
                .iter()
                .find(|s| s.id == binding.temp_sensor_id)
                .ok_or_else(|| {
                    Error::hardware(
                        index,
                        format!("unknown temp sensor {}", binding.temp_sensor_id),
                    )
                })?;

            if fan.rpm_path.is_none() {
                log::warn!("Fan {} has no tachometer; it cannot be verified", fan.id);
            }
            log::info!("Channel {index}: {} driven by {}", fan.id, sensor.id);

            channels.push(HwmonChannel {
                fan: fan.clone(),
                sensor: sensor.clone(),
                manual: AtomicBool::new(false),
            });
        }

        Ok(Self { channels })
    }

    /// A backend with no channels.
    pub fn empty() -> Self {
        Self {
            channels: Vec::new(),
        }
    }

    /// Hand every channel back to automatic (BIOS) control.
    pub fn restore_all_automatic(&self) {
        for channel in &self.channels {
            match fs::write(&channel.fan.pwm_enable_path, "2") {
                Ok(()) => channel.manual.store(false, Ordering::SeqCst),
                Err(e) => log::warn!(
                    "Failed to restore automatic control for {}: {e}",
                    channel.fan.id
                ),
            }
        }
    }

    fn channel(&self, index: usize) -> Result<&HwmonChannel> {
        self.channels.get(index).ok_or(Error::UnknownChannel(index))
    }
}

impl FanHardware for HwmonBackend {
    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn read_temperature(&self, channel: usize) -> Result<f64> {
        let ch = self.channel(channel)?;
        let millic: i64 = read_parsed(&ch.sensor.input_path).map_err(|e| Error::hardware(channel, e))?;
        Ok(millic as f64 / 1000.0)
    }

    fn read_fan_state(&self, channel: usize) -> Result<FanState> {
        let ch = self.channel(channel)?;
        let rpm_path = ch
            .fan
            .rpm_path
            .as_ref()
            .ok_or_else(|| Error::hardware(channel, "fan has no tachometer"))?;
        let rpm: u32 = read_parsed(rpm_path).map_err(|e| Error::hardware(channel, e))?;
        let pwm: u8 = read_parsed(&ch.fan.pwm_path).map_err(|e| Error::hardware(channel, e))?;
        Ok(FanState {
            rpm,
            level: pwm_to_percent(pwm),
        })
    }

    fn write_duty_cycle(&self, channel: usize, percent: u8) -> Result<()> {
        let ch = self.channel(channel)?;
        if !ch.manual.load(Ordering::SeqCst) {
            // Curves and overrides write PWM through manual mode.
            fs::write(&ch.fan.pwm_enable_path, "1").map_err(|e| Error::hardware(channel, e))?;
            ch.manual.store(true, Ordering::SeqCst);
        }
        fs::write(&ch.fan.pwm_path, percent_to_pwm(percent).to_string())
            .map_err(|e| Error::hardware(channel, e))
    }

    fn supports_verification(&self, channel: usize) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|c| c.fan.rpm_path.is_some())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_parsed<T: std::str::FromStr>(path: &Path) -> std::result::Result<T, String> {
    let raw = fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    raw.trim()
        .parse()
        .map_err(|_| format!("{}: unexpected value {:?}", path.display(), raw.trim()))
}

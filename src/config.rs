//! Console configuration.
//!
//! Built-in defaults can be overridden by an optional TOML file and then by
//! command-line flags. Every field is optional in the file:
//!
//! ```toml
//! [serial]
//! device = "/dev/ttyUSB0"
//! baud_rate = 115200
//! timeout_ms = 100
//!
//! [schedule]
//! heartbeat_ms = 50
//! interval_secs = 10
//! time_window_ms = 50
//!
//! [log]
//! level = "debug"
//! file = "pbbes.log"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Accepted measurement interval range, in seconds.
pub const INTERVAL_RANGE: std::ops::RangeInclusive<u16> = 1..=999;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("measurement interval must be between 1 and 999 seconds, got {0}")]
    Interval(u16),

    #[error("heartbeat must be longer than zero")]
    Heartbeat,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Read and write timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    /// Keyboard responsiveness.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Device polling interval.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u16,
    /// Events due this close together are handled in one wake-up.
    #[serde(default = "default_time_window_ms")]
    pub time_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// `tracing` level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_file")]
    pub file: PathBuf,
}

fn default_device() -> String {
    String::from("/dev/ttyUSB0")
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_timeout_ms() -> u64 {
    100
}
fn default_heartbeat_ms() -> u64 {
    50
}
fn default_interval_secs() -> u16 {
    10
}
fn default_time_window_ms() -> u64 {
    50
}
fn default_log_level() -> String {
    String::from("debug")
}
fn default_log_file() -> PathBuf {
    PathBuf::from("pbbes.log")
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            interval_secs: default_interval_secs(),
            time_window_ms: default_time_window_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ScheduleConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_secs))
    }

    pub fn time_window(&self) -> Duration {
        Duration::from_millis(self.time_window_ms)
    }
}

impl Config {
    /// Reads a TOML file; absent fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !INTERVAL_RANGE.contains(&self.schedule.interval_secs) {
            return Err(ConfigError::Interval(self.schedule.interval_secs));
        }
        if self.schedule.heartbeat_ms == 0 {
            return Err(ConfigError::Heartbeat);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.serial.device, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.serial.timeout(), Duration::from_millis(100));
        assert_eq!(config.schedule.heartbeat(), Duration::from_millis(50));
        assert_eq!(config.schedule.interval(), Duration::from_secs(10));
        assert_eq!(config.schedule.time_window(), Duration::from_millis(50));
        assert_eq!(config.log.level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[serial]\ndevice = \"/dev/ttyACM0\"\n\n[schedule]\ninterval_secs = 30").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.serial.device, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.schedule.interval_secs, 30);
        assert_eq!(config.schedule.heartbeat_ms, 50);
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn empty_file_is_default() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(Config::load(file.path()).unwrap(), Config::default());
    }

    #[test]
    fn interval_out_of_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[schedule]\ninterval_secs = 0").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Interval(0))));
    }

    #[test]
    fn malformed_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[serial\ndevice = ").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file() {
        let err = Config::load(Path::new("/nonexistent/pbbes.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

//! Station configuration consumed by the serial link and the camera supervisor.
//!
//! Loaded from a JSON file (settings persistence lives outside this crate) or
//! from `PROGBOT_*` environment variables. Missing fields take defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{DEFAULT_SCAN_RETRIES, DriverMode};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    /// Total time budget for one exchange, split across retries.
    pub timeout_secs: f64,
    pub retries: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud: 115_200,
            timeout_secs: 5.0,
            retries: 1,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        secs_to_duration(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Use the board camera driver instead of a generic capture device.
    pub use_primary_driver: bool,
    pub driver_index: u32,
    pub command_timeout_secs: f64,
    pub enqueue_timeout_secs: f64,
    pub scan_retries: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            use_primary_driver: true,
            driver_index: 0,
            command_timeout_secs: 10.0,
            enqueue_timeout_secs: 1.0,
            scan_retries: DEFAULT_SCAN_RETRIES,
        }
    }
}

impl CameraConfig {
    pub fn driver_mode(&self) -> DriverMode {
        if self.use_primary_driver {
            DriverMode::Primary
        } else {
            DriverMode::Device {
                index: self.driver_index,
            }
        }
    }

    pub fn command_timeout(&self) -> Duration {
        secs_to_duration(self.command_timeout_secs)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        secs_to_duration(self.enqueue_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub serial: SerialConfig,
    pub camera: CameraConfig,
}

impl StationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.serial.port = port.into();
        self
    }

    pub fn with_baud(mut self, baud: u32) -> Self {
        self.serial.baud = baud;
        self
    }

    pub fn with_serial_timeout(mut self, timeout: Duration) -> Self {
        self.serial.timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_serial_retries(mut self, retries: u32) -> Self {
        self.serial.retries = retries;
        self
    }

    pub fn with_driver_mode(mut self, mode: DriverMode) -> Self {
        match mode {
            DriverMode::Primary => self.camera.use_primary_driver = true,
            DriverMode::Device { index } => {
                self.camera.use_primary_driver = false;
                self.camera.driver_index = index;
            }
        }
        self
    }

    pub fn with_scan_retries(mut self, retries: u32) -> Self {
        self.camera.scan_retries = retries;
        self
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject timeouts that are negative, NaN or too large for a `Duration`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_secs("serial.timeout_secs", self.serial.timeout_secs)?;
        check_secs("camera.command_timeout_secs", self.camera.command_timeout_secs)?;
        check_secs("camera.enqueue_timeout_secs", self.camera.enqueue_timeout_secs)?;
        Ok(())
    }

    /// Defaults overridden by `PROGBOT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = lookup("PROGBOT_SERIAL_PORT") {
            config.serial.port = port;
        }
        if let Some(baud) = parse_var(&lookup, "PROGBOT_SERIAL_BAUD")? {
            config.serial.baud = baud;
        }
        if let Some(secs) = parse_secs(&lookup, "PROGBOT_SERIAL_TIMEOUT")? {
            config.serial.timeout_secs = secs;
        }
        if let Some(retries) = parse_var(&lookup, "PROGBOT_SERIAL_RETRIES")? {
            config.serial.retries = retries;
        }
        if let Some(raw) = lookup("PROGBOT_USE_PRIMARY_DRIVER") {
            config.camera.use_primary_driver = parse_bool("PROGBOT_USE_PRIMARY_DRIVER", &raw)?;
        }
        if let Some(index) = parse_var(&lookup, "PROGBOT_DRIVER_INDEX")? {
            config.camera.driver_index = index;
        }
        if let Some(secs) = parse_secs(&lookup, "PROGBOT_COMMAND_TIMEOUT")? {
            config.camera.command_timeout_secs = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "PROGBOT_ENQUEUE_TIMEOUT")? {
            config.camera.enqueue_timeout_secs = secs;
        }
        if let Some(retries) = parse_var(&lookup, "PROGBOT_SCAN_RETRIES")? {
            config.camera.scan_retries = retries;
        }

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<f64>, ConfigError> {
    match parse_var::<f64>(lookup, key)? {
        None => Ok(None),
        Some(secs) => check_secs(key, secs).map(Some),
    }
}

fn check_secs(key: &'static str, secs: f64) -> Result<f64, ConfigError> {
    Duration::try_from_secs_f64(secs)
        .map(|_| secs)
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: secs.to_string(),
        })
}

/// Saturating conversion for values set directly on the public fields.
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

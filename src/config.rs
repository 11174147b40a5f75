//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Result, RotorRpmError};
use crate::esc::MAX_MOTORS;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub esc_sensor: EscSensorConfig,
    #[serde(default)]
    pub motors: MotorConfig,
    #[serde(default)]
    pub rpm: RpmConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// ESC telemetry wire protocol
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EscProtocol {
    /// Polled 10-byte frames, one request per motor
    Kiss,
    /// Hobbywing V4 continuous 19-byte stream
    Hw4,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Telemetry port; empty means no port is assigned to the ESC sensor
    #[serde(default)]
    pub port: String,

    #[serde(default)]
    pub half_duplex: bool,
}

/// ESC sensor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EscSensorConfig {
    #[serde(default = "default_esc_sensor_enabled")]
    pub enabled: bool,

    #[serde(default = "default_protocol")]
    pub protocol: EscProtocol,

    #[serde(default = "default_update_hz")]
    pub update_hz: u32,

    #[serde(default = "default_hw4_current_offset")]
    pub hw4_current_offset: u16,

    #[serde(default = "default_hw4_current_gain")]
    pub hw4_current_gain: u16,

    #[serde(default = "default_hw4_voltage_gain")]
    pub hw4_voltage_gain: u16,
}

/// Motor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MotorConfig {
    #[serde(default = "default_motor_count")]
    pub count: usize,

    #[serde(default = "default_motors_enabled")]
    pub enabled: bool,

    /// Magnetic pole count per motor
    #[serde(default)]
    pub pole_count: Vec<u16>,

    /// RPM low-pass cutoff per motor in Hz
    #[serde(default)]
    pub rpm_lpf_hz: Vec<u16>,

    #[serde(default)]
    pub protocol_dshot: bool,

    #[serde(default)]
    pub use_dshot_telemetry: bool,
}

/// RPM source configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RpmConfig {
    #[serde(default)]
    pub freq_sensor_enabled: bool,

    /// RPM update period in microseconds (filter sample time)
    #[serde(default = "default_looptime_us")]
    pub looptime_us: u32,
}

/// Telemetry record logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,

    #[serde(default = "default_log_interval_ms")]
    pub log_interval_ms: u64,
}

// Default value functions
fn default_esc_sensor_enabled() -> bool { true }
fn default_protocol() -> EscProtocol { EscProtocol::Kiss }
fn default_update_hz() -> u32 { 1000 }
fn default_hw4_current_offset() -> u16 { 15 }
fn default_hw4_current_gain() -> u16 { 100 }
fn default_hw4_voltage_gain() -> u16 { 110 }

fn default_motor_count() -> usize { 1 }
fn default_motors_enabled() -> bool { true }
fn default_pole_count() -> u16 { 10 }
fn default_rpm_lpf_hz() -> u16 { 100 }

fn default_looptime_us() -> u32 { 1000 }

fn default_log_dir() -> String { "./logs".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }
fn default_log_interval_ms() -> u64 { 1000 }

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            half_duplex: false,
        }
    }
}

impl Default for EscSensorConfig {
    fn default() -> Self {
        Self {
            enabled: default_esc_sensor_enabled(),
            protocol: default_protocol(),
            update_hz: default_update_hz(),
            hw4_current_offset: default_hw4_current_offset(),
            hw4_current_gain: default_hw4_current_gain(),
            hw4_voltage_gain: default_hw4_voltage_gain(),
        }
    }
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            count: default_motor_count(),
            enabled: default_motors_enabled(),
            pole_count: Vec::new(),
            rpm_lpf_hz: Vec::new(),
            protocol_dshot: false,
            use_dshot_telemetry: false,
        }
    }
}

impl Default for RpmConfig {
    fn default() -> Self {
        Self {
            freq_sensor_enabled: false,
            looptime_us: default_looptime_us(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
            log_interval_ms: default_log_interval_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            esc_sensor: EscSensorConfig::default(),
            motors: MotorConfig::default(),
            rpm: RpmConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl MotorConfig {
    /// Pole count of `motor`, falling back to the default for unlisted motors
    pub fn pole_count_for(&self, motor: usize) -> u16 {
        self.pole_count.get(motor).copied().unwrap_or_else(default_pole_count)
    }

    /// RPM filter cutoff of `motor` in Hz, falling back to the default
    pub fn rpm_lpf_hz_for(&self, motor: usize) -> u16 {
        self.rpm_lpf_hz.get(motor).copied().unwrap_or_else(default_rpm_lpf_hz)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rotor_rpm::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.esc_sensor.update_hz < 10 || self.esc_sensor.update_hz > 2000 {
            return Err(RotorRpmError::Config(
                toml::de::Error::custom("update_hz must be between 10 and 2000")
            ));
        }

        if self.esc_sensor.hw4_current_gain == 0 {
            return Err(RotorRpmError::Config(
                toml::de::Error::custom("hw4_current_gain must be greater than 0")
            ));
        }

        if self.esc_sensor.hw4_voltage_gain == 0 {
            return Err(RotorRpmError::Config(
                toml::de::Error::custom("hw4_voltage_gain must be greater than 0")
            ));
        }

        if self.motors.count == 0 || self.motors.count > MAX_MOTORS {
            return Err(RotorRpmError::Config(
                toml::de::Error::custom(format!("motor count must be between 1 and {}", MAX_MOTORS))
            ));
        }

        if self.motors.pole_count.len() > self.motors.count {
            return Err(RotorRpmError::Config(
                toml::de::Error::custom("pole_count lists more motors than count")
            ));
        }

        if self.motors.rpm_lpf_hz.len() > self.motors.count {
            return Err(RotorRpmError::Config(
                toml::de::Error::custom("rpm_lpf_hz lists more motors than count")
            ));
        }

        if self.rpm.looptime_us == 0 || self.rpm.looptime_us > 100_000 {
            return Err(RotorRpmError::Config(
                toml::de::Error::custom("looptime_us must be between 1 and 100000")
            ));
        }

        // The RPM filter is designed for looptime_us but stepped once per tick
        let tick_us = 1_000_000 / self.esc_sensor.update_hz;
        if self.rpm.looptime_us != tick_us {
            return Err(RotorRpmError::Config(
                toml::de::Error::custom(format!(
                    "looptime_us must equal 1000000 / update_hz ({})",
                    tick_us
                ))
            ));
        }

        if self.telemetry.enabled && self.telemetry.log_dir.is_empty() {
            return Err(RotorRpmError::Config(
                toml::de::Error::custom("telemetry log_dir cannot be empty when enabled")
            ));
        }

        if self.telemetry.max_records_per_file == 0 {
            return Err(RotorRpmError::Config(
                toml::de::Error::custom("max_records_per_file must be greater than 0")
            ));
        }

        if self.telemetry.max_files_to_keep == 0 {
            return Err(RotorRpmError::Config(
                toml::de::Error::custom("max_files_to_keep must be greater than 0")
            ));
        }

        if self.telemetry.log_interval_ms == 0 || self.telemetry.log_interval_ms > 60000 {
            return Err(RotorRpmError::Config(
                toml::de::Error::custom("log_interval_ms must be between 1 and 60000")
            ));
        }

        Ok(())
    }
}

//! # Error Types
//!
//! Custom error types for Rotor RPM using `thiserror`.
//!
//! Frame-level failures (CRC mismatch, sanity check, response timeout) are
//! never reported here. They are counted and reflected in the data age of
//! the affected motor instead.

use thiserror::Error;

/// Main error type for Rotor RPM
#[derive(Debug, Error)]
pub enum RotorRpmError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(String),

    /// None of the candidate serial devices could be opened
    #[error("No ESC telemetry port found (tried: {0})")]
    SerialPortNotFound(String),

    /// ESC sensor enabled without a serial port to read from
    #[error("ESC sensor has no telemetry transport configured")]
    NoTransport,

    /// Debug record writer errors
    #[error("Telemetry logger error: {0}")]
    Logger(String),
}

/// Result type alias for Rotor RPM
pub type Result<T> = std::result::Result<T, RotorRpmError>;

//! # ESC Sensor Module
//!
//! Serial ESC telemetry, decoded into one record per motor.
//!
//! This module handles:
//! - The per-motor telemetry store and its combined aggregate
//! - KISS polled telemetry (10-byte frames, CRC-8)
//! - Hobbywing V4 streamed telemetry (19-byte frames, sanity-checked)
//! - Selecting one protocol at init behind a single facade

pub mod crc;
pub mod hw4;
pub mod kiss;

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::{EscProtocol, EscSensorConfig};
use crate::error::{Result, RotorRpmError};
use crate::transport::{ByteSource, FrameBuffer, MotorDriver};

pub use hw4::Hw4Telemetry;
pub use kiss::KissTelemetry;

/// Number of motor telemetry slots
pub const MAX_MOTORS: usize = 4;

/// Data age ceiling: a record at this age has never been or is no longer valid
pub const DATA_AGE_INVALID: u8 = 255;

/// Telemetry of one ESC
///
/// Voltage and current are in hundredths (centivolts, centiamps),
/// consumption in mAh. `rpm` is the raw ESC reading before pole-count
/// conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MotorTelemetry {
    /// Ticks since the last valid update, saturating at [`DATA_AGE_INVALID`]
    pub data_age: u8,
    pub temperature: i16,
    pub voltage: i32,
    pub current: i32,
    pub consumption: i32,
    pub rpm: i32,
}

impl MotorTelemetry {
    /// A record that has never been updated
    pub const fn invalid() -> Self {
        Self {
            data_age: DATA_AGE_INVALID,
            temperature: 0,
            voltage: 0,
            current: 0,
            consumption: 0,
            rpm: 0,
        }
    }

    /// False once the record's age has reached the invalid ceiling
    pub fn is_valid(&self) -> bool {
        self.data_age < DATA_AGE_INVALID
    }
}

/// Which telemetry record to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryTarget {
    Motor(usize),
    /// Aggregate over all motors
    Combined,
}

/// Per-motor telemetry records plus a lazily computed aggregate
#[derive(Debug, Clone)]
pub struct TelemetryStore {
    motors: [MotorTelemetry; MAX_MOTORS],
    combined: MotorTelemetry,
    combined_dirty: bool,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryStore {
    /// All slots start out invalid
    pub fn new() -> Self {
        Self {
            motors: [MotorTelemetry::invalid(); MAX_MOTORS],
            combined: MotorTelemetry::default(),
            combined_dirty: true,
        }
    }

    pub fn motor(&self, motor: usize) -> Option<&MotorTelemetry> {
        self.motors.get(motor)
    }

    /// Mutable access to one record; marks the aggregate for recomputation
    pub fn motor_mut(&mut self, motor: usize) -> Option<&mut MotorTelemetry> {
        let record = self.motors.get_mut(motor)?;
        self.combined_dirty = true;
        Some(record)
    }

    /// Age a record by one tick, saturating at [`DATA_AGE_INVALID`]
    pub fn bump_age(&mut self, motor: usize) {
        if let Some(record) = self.motors.get_mut(motor) {
            if record.data_age < DATA_AGE_INVALID {
                record.data_age += 1;
                self.combined_dirty = true;
            }
        }
    }

    /// Aggregate over the first `motor_count` records
    ///
    /// Age and temperature are maxima, current and consumption are sums,
    /// voltage and RPM are averages. Recomputed only after a record changed.
    pub fn combined(&mut self, motor_count: usize) -> MotorTelemetry {
        let count = motor_count.min(MAX_MOTORS);
        if self.combined_dirty && count > 0 {
            let mut combined = MotorTelemetry::default();

            for record in &self.motors[..count] {
                combined.data_age = combined.data_age.max(record.data_age);
                combined.temperature = combined.temperature.max(record.temperature);
                combined.voltage += record.voltage;
                combined.current += record.current;
                combined.consumption += record.consumption;
                combined.rpm += record.rpm;
            }

            combined.voltage /= count as i32;
            combined.rpm /= count as i32;

            self.combined = combined;
            self.combined_dirty = false;
        }

        self.combined
    }
}

/// Fields of the last HW4 frame that are not part of [`MotorTelemetry`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Hw4FrameInfo {
    pub counter: u32,
    pub throttle: u16,
    pub pwm: u16,
    pub raw_rpm: u32,
    pub fet_temperature: f32,
    pub bec_temperature: f32,
}

/// Diagnostic counters of the active protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EscStats {
    /// Motor currently being polled (always 0 for HW4)
    pub motor_index: usize,
    /// KISS requests that got no frame in time
    pub timeout_count: u32,
    /// KISS CRC mismatches and HW4 sanity check failures
    pub crc_error_count: u32,
    /// Data age of the current motor
    pub data_age: u8,
    /// Bytes sitting in the HW4 synchronizer
    pub bytes_buffered: usize,
    pub hw4_last_frame: Option<Hw4FrameInfo>,
}

/// One ESC telemetry wire protocol
pub trait TelemetryProtocol: Send {
    fn protocol(&self) -> EscProtocol;

    /// Run one scheduler tick at `now_us`
    fn process(&mut self, now_us: u64, motors: &mut dyn MotorDriver);

    /// Read a telemetry record, `None` if `target` is not valid for this protocol
    fn telemetry(&mut self, target: TelemetryTarget, motor_count: usize) -> Option<MotorTelemetry>;

    /// Raw RPM reading of `motor` (0 when unknown)
    fn erpm(&self, motor: usize) -> i32;

    fn stats(&self) -> EscStats;
}

/// Receive path handed to the ESC sensor at init
pub enum EscTransport {
    /// Capture buffer filled by the asynchronous receive path
    Kiss(Arc<FrameBuffer>),
    /// Polled byte stream
    Hw4(Box<dyn ByteSource>),
}

impl std::fmt::Debug for EscTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscTransport::Kiss(buffer) => f.debug_tuple("Kiss").field(buffer).finish(),
            EscTransport::Hw4(_) => f.debug_tuple("Hw4").finish_non_exhaustive(),
        }
    }
}

/// ESC telemetry facade over the protocol chosen at init
pub struct EscSensor {
    protocol: Box<dyn TelemetryProtocol>,
}

impl std::fmt::Debug for EscSensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscSensor")
            .field("protocol", &self.protocol.protocol())
            .finish_non_exhaustive()
    }
}

impl EscSensor {
    /// Set up the configured protocol on `transport`
    ///
    /// # Errors
    ///
    /// Returns [`RotorRpmError::NoTransport`] when there is no transport, or
    /// when the transport cannot carry the configured protocol.
    pub fn init(config: &EscSensorConfig, transport: Option<EscTransport>) -> Result<Self> {
        let protocol: Box<dyn TelemetryProtocol> = match (config.protocol, transport) {
            (EscProtocol::Kiss, Some(EscTransport::Kiss(buffer))) => {
                Box::new(KissTelemetry::new(buffer))
            }
            (EscProtocol::Hw4, Some(EscTransport::Hw4(source))) => {
                Box::new(Hw4Telemetry::new(source, hw4::Hw4Calibration::from_config(config)))
            }
            _ => return Err(RotorRpmError::NoTransport),
        };

        info!("ESC sensor initialized ({:?})", config.protocol);
        Ok(Self { protocol })
    }

    pub fn protocol(&self) -> EscProtocol {
        self.protocol.protocol()
    }

    /// Run one tick; nothing happens while the motors are disabled
    pub fn process(&mut self, now_us: u64, motors: &mut dyn MotorDriver) {
        if !motors.motor_is_enabled() {
            return;
        }

        self.protocol.process(now_us, motors);
    }

    pub fn telemetry(&mut self, target: TelemetryTarget, motor_count: usize) -> Option<MotorTelemetry> {
        self.protocol.telemetry(target, motor_count)
    }

    pub fn erpm(&self, motor: usize) -> i32 {
        self.protocol.erpm(motor)
    }

    pub fn stats(&self) -> EscStats {
        self.protocol.stats()
    }
}

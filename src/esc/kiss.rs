//! # KISS ESC Telemetry
//!
//! Polled telemetry: one request per tick cycle, answered by a fixed
//! 10-byte frame at 115200 baud.
//!
//! ```text
//! Byte 0:      Temperature (°C)
//! Byte 1,2:    Voltage (cV, big-endian)
//! Byte 3,4:    Current (cA, big-endian)
//! Byte 5,6:    Consumption (mAh, big-endian)
//! Byte 7,8:    RPM (ESC units, big-endian)
//! Byte 9:      CRC8 (poly 0x07) over bytes 0..9
//! ```
//!
//! Motors are polled round-robin. A motor that does not answer within
//! [`ESC_REQUEST_TIMEOUT_MS`] is skipped until its next turn, so one dead
//! ESC never stalls the others.

use std::sync::Arc;

use tracing::{debug, info, trace};

use super::crc::{crc8_kiss, validate_crc8_kiss};
use super::{EscStats, MotorTelemetry, TelemetryProtocol, TelemetryStore, TelemetryTarget};
use crate::config::EscProtocol;
use crate::transport::{FrameBuffer, MotorDriver};

/// KISS telemetry frame size (9 payload bytes + CRC)
pub const KISS_FRAME_SIZE: usize = 10;

/// Delay after boot before the first request, lets the ESCs finish booting
pub const ESC_BOOT_TIME_MS: u64 = 5000;

/// Time allowed for one frame to arrive (the transfer itself takes ~900 µs)
pub const ESC_REQUEST_TIMEOUT_MS: u64 = 100;

/// Outcome of inspecting the capture buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Not all bytes have arrived yet
    Pending,
    /// Valid frame, stored
    Complete,
    /// CRC mismatch, discarded
    Failed,
}

/// Request scheduler phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPhase {
    /// Waiting for the ESC boot delay
    Startup,
    /// A request is in flight
    AwaitingResponse,
}

/// Decoded fields of a KISS frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KissFrame {
    pub temperature: u8,
    pub voltage: u16,
    pub current: u16,
    pub consumption: u16,
    pub rpm: u16,
}

impl KissFrame {
    /// Decode a complete frame, `None` on CRC mismatch
    ///
    /// # Examples
    ///
    /// ```
    /// use rotor_rpm::esc::kiss::KissFrame;
    ///
    /// let frame = KissFrame { temperature: 10, voltage: 220, current: 5, consumption: 10, rpm: 500 };
    /// assert_eq!(KissFrame::decode(&frame.encode()), Some(frame));
    /// ```
    pub fn decode(buf: &[u8; KISS_FRAME_SIZE]) -> Option<Self> {
        if !validate_crc8_kiss(&buf[..KISS_FRAME_SIZE - 1], buf[KISS_FRAME_SIZE - 1]) {
            return None;
        }

        Some(Self {
            temperature: buf[0],
            voltage: u16::from_be_bytes([buf[1], buf[2]]),
            current: u16::from_be_bytes([buf[3], buf[4]]),
            consumption: u16::from_be_bytes([buf[5], buf[6]]),
            rpm: u16::from_be_bytes([buf[7], buf[8]]),
        })
    }

    /// Build the on-wire frame including its CRC
    pub fn encode(&self) -> [u8; KISS_FRAME_SIZE] {
        let mut buf = [0u8; KISS_FRAME_SIZE];
        buf[0] = self.temperature;
        buf[1..3].copy_from_slice(&self.voltage.to_be_bytes());
        buf[3..5].copy_from_slice(&self.current.to_be_bytes());
        buf[5..7].copy_from_slice(&self.consumption.to_be_bytes());
        buf[7..9].copy_from_slice(&self.rpm.to_be_bytes());
        buf[KISS_FRAME_SIZE - 1] = crc8_kiss(&buf[..KISS_FRAME_SIZE - 1]);
        buf
    }

    /// Fresh telemetry record (data age 0) carrying this frame's values
    pub fn to_telemetry(&self) -> MotorTelemetry {
        MotorTelemetry {
            data_age: 0,
            temperature: self.temperature as i16,
            voltage: self.voltage as i32,
            current: self.current as i32,
            consumption: self.consumption as i32,
            rpm: self.rpm as i32,
        }
    }
}

/// Inspect the capture buffer and store a valid frame for `motor`
///
/// A failed frame leaves the stored record untouched.
pub fn decode_esc_frame(buffer: &FrameBuffer, store: &mut TelemetryStore, motor: usize) -> FrameState {
    if !buffer.is_complete() {
        return FrameState::Pending;
    }

    match KissFrame::decode(&buffer.contents::<KISS_FRAME_SIZE>()) {
        Some(frame) => {
            if let Some(record) = store.motor_mut(motor) {
                *record = frame.to_telemetry();
            }
            trace!(
                "KISS motor {}: rpm={} temp={} voltage={}",
                motor,
                frame.rpm,
                frame.temperature,
                frame.voltage
            );
            FrameState::Complete
        }
        None => FrameState::Failed,
    }
}

/// KISS request scheduler and decoder
#[derive(Debug)]
pub struct KissTelemetry {
    buffer: Arc<FrameBuffer>,
    store: TelemetryStore,
    phase: TriggerPhase,
    motor: usize,
    request_timestamp_ms: u64,
    timeout_count: u32,
    crc_error_count: u32,
}

impl KissTelemetry {
    /// `buffer` is shared with the receive path that fills it
    pub fn new(buffer: Arc<FrameBuffer>) -> Self {
        Self {
            buffer,
            store: TelemetryStore::new(),
            phase: TriggerPhase::Startup,
            motor: 0,
            request_timestamp_ms: 0,
            timeout_count: 0,
            crc_error_count: 0,
        }
    }

    pub fn phase(&self) -> TriggerPhase {
        self.phase
    }

    /// Motor the in-flight request was sent to
    pub fn current_motor(&self) -> usize {
        self.motor
    }

    pub fn timeout_count(&self) -> u32 {
        self.timeout_count
    }

    pub fn crc_error_count(&self) -> u32 {
        self.crc_error_count
    }

    fn select_next_motor(&mut self, motor_count: usize) {
        self.motor += 1;
        if self.motor >= motor_count {
            self.motor = 0;
        }
    }

    fn set_request(&mut self, now_ms: u64, motors: &mut dyn MotorDriver) {
        self.buffer.arm(KISS_FRAME_SIZE);
        motors.request_telemetry(self.motor);

        self.phase = TriggerPhase::AwaitingResponse;
        self.request_timestamp_ms = now_ms;
    }
}

impl TelemetryProtocol for KissTelemetry {
    fn protocol(&self) -> EscProtocol {
        EscProtocol::Kiss
    }

    fn process(&mut self, now_us: u64, motors: &mut dyn MotorDriver) {
        let now_ms = now_us / 1000;
        let motor_count = motors.motor_count();

        match self.phase {
            TriggerPhase::Startup => {
                if now_ms >= ESC_BOOT_TIME_MS {
                    info!("ESC boot delay elapsed, starting KISS telemetry requests");
                    self.set_request(now_ms, motors);
                }
            }
            TriggerPhase::AwaitingResponse => {
                if now_ms < self.request_timestamp_ms + ESC_REQUEST_TIMEOUT_MS {
                    match decode_esc_frame(&self.buffer, &mut self.store, self.motor) {
                        FrameState::Complete => {
                            self.select_next_motor(motor_count);
                            self.set_request(now_ms, motors);
                        }
                        FrameState::Failed => {
                            self.crc_error_count += 1;
                            debug!(
                                "KISS CRC error on motor {} (total {})",
                                self.motor, self.crc_error_count
                            );
                            self.store.bump_age(self.motor);
                            self.select_next_motor(motor_count);
                            self.set_request(now_ms, motors);
                        }
                        FrameState::Pending => {}
                    }
                } else {
                    // Move on to the next ESC, this one gets another turn next cycle
                    self.timeout_count += 1;
                    debug!(
                        "KISS timeout on motor {} after {} bytes (total {})",
                        self.motor,
                        self.buffer.bytes_read(),
                        self.timeout_count
                    );
                    self.store.bump_age(self.motor);
                    self.select_next_motor(motor_count);
                    self.set_request(now_ms, motors);
                }
            }
        }
    }

    fn telemetry(&mut self, target: TelemetryTarget, motor_count: usize) -> Option<MotorTelemetry> {
        match target {
            TelemetryTarget::Motor(motor) if motor < motor_count => self.store.motor(motor).copied(),
            TelemetryTarget::Motor(_) => None,
            TelemetryTarget::Combined => Some(self.store.combined(motor_count)),
        }
    }

    fn erpm(&self, motor: usize) -> i32 {
        self.store.motor(motor).map_or(0, |record| record.rpm)
    }

    fn stats(&self) -> EscStats {
        EscStats {
            motor_index: self.motor,
            timeout_count: self.timeout_count,
            crc_error_count: self.crc_error_count,
            data_age: self.store.motor(self.motor).map_or(0, |record| record.data_age),
            bytes_buffered: self.buffer.bytes_read(),
            hw4_last_frame: None,
        }
    }
}

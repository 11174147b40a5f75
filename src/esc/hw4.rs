//! # Hobbywing V4 ESC Telemetry
//!
//! Continuous 19200 baud stream of 19-byte frames without framing beyond a
//! sync byte. Protocol layout after <https://github.com/dgatf/msrc/>:
//!
//! ```text
//! Byte 0:          Sync 0x9B
//! Byte 1,2,3:      Packet counter
//! Byte 4,5:        Throttle
//! Byte 6,7:        PWM
//! Byte 8,9,10:     RPM
//! Byte 11,12:      Voltage (raw ADC)
//! Byte 13,14:      Current (raw ADC)
//! Byte 15,16:      Temperature FETs (raw ADC)
//! Byte 17,18:      Temperature BEC (raw ADC)
//! ```
//!
//! All fields are big-endian. The ESC reports as a single aggregate, stored
//! in motor slot 0.
//!
//! Voltage gain by ESC model: 3-6S (LV) 110, 3-8S (LVv2) 154, 5-12S (HV) 210.
//! Current gain by rating: 60A 60, 80A 78, 100A 90, 120A 100, 130A 113,
//! 150A 129, 160A 137, 200A 169.

use tracing::{debug, trace};

use super::{EscStats, Hw4FrameInfo, MotorTelemetry, TelemetryProtocol, TelemetryStore, TelemetryTarget};
use crate::config::{EscProtocol, EscSensorConfig};
use crate::transport::{ByteSource, MotorDriver};

/// Frame length including the sync byte
pub const HW4_FRAME_SIZE: usize = 19;

/// First byte of every data frame
pub const HW4_SYNC_BYTE: u8 = 0x9B;

/// Bytes following a doubled sync byte that belong to a signature packet
pub const HW4_SIGNATURE_SKIP: u8 = 11;

/// Data age grows by one for every interval without a valid frame
pub const HW4_DATA_AGE_INTERVAL_US: u64 = 250_000;

const V_REF: f32 = 3.3;
const DIFFAMP_SHUNT: f32 = 0.00025;
const ADC_RESOLUTION: f32 = 4096.0;
const NTC_BETA: f32 = 3950.0;
const NTC_R1: f32 = 10000.0;
const NTC_R_REF: f32 = 47000.0;

/// Resynchronizing frame extractor for the HW4 byte stream
#[derive(Debug, Clone)]
pub struct Hw4Synchronizer {
    frame: [u8; HW4_FRAME_SIZE],
    bytes_read: usize,
    skip_bytes: u8,
}

impl Default for Hw4Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Hw4Synchronizer {
    pub fn new() -> Self {
        Self {
            frame: [0; HW4_FRAME_SIZE],
            bytes_read: 0,
            skip_bytes: 0,
        }
    }

    /// Bytes of the frame collected so far
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    /// Feed one byte, returns the frame once all 19 bytes are in
    pub fn push(&mut self, byte: u8) -> Option<[u8; HW4_FRAME_SIZE]> {
        if self.skip_bytes > 0 {
            self.skip_bytes -= 1;
        } else if self.bytes_read == 0 && byte == HW4_SYNC_BYTE {
            self.frame[0] = byte;
            self.bytes_read = 1;
        } else if self.bytes_read == 1 && byte == HW4_SYNC_BYTE {
            // Signature packet, not telemetry
            self.bytes_read = 0;
            self.skip_bytes = HW4_SIGNATURE_SKIP;
        } else if self.bytes_read > 0 {
            self.frame[self.bytes_read] = byte;
            self.bytes_read += 1;
            if self.bytes_read == HW4_FRAME_SIZE {
                self.bytes_read = 0;
                return Some(self.frame);
            }
        }

        None
    }
}

/// Raw fields of a frame that passed the sanity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hw4Frame {
    pub counter: u32,
    pub throttle: u16,
    pub pwm: u16,
    pub rpm: u32,
    pub voltage: u16,
    pub current: u16,
    pub temp_fet: u16,
    pub temp_bec: u16,
}

impl Hw4Frame {
    /// Parse a synchronized frame
    ///
    /// Returns `None` when any of the high bytes that are always small in real
    /// telemetry is out of range. HW4 carries no checksum, so this is the only
    /// integrity check.
    pub fn parse(frame: &[u8; HW4_FRAME_SIZE]) -> Option<Self> {
        let sane = frame[4] < 4
            && frame[6] < 4
            && frame[8] < 4
            && frame[11] < 0x0F
            && frame[13] < 0x0F
            && frame[15] < 0x0F
            && frame[17] < 0x0F;
        if !sane {
            return None;
        }

        Some(Self {
            counter: u32::from_be_bytes([0, frame[1], frame[2], frame[3]]),
            throttle: u16::from_be_bytes([frame[4], frame[5]]),
            pwm: u16::from_be_bytes([frame[6], frame[7]]),
            rpm: u32::from_be_bytes([0, frame[8], frame[9], frame[10]]),
            voltage: u16::from_be_bytes([frame[11], frame[12]]),
            current: u16::from_be_bytes([frame[13], frame[14]]),
            temp_fet: u16::from_be_bytes([frame[15], frame[16]]),
            temp_bec: u16::from_be_bytes([frame[17], frame[18]]),
        })
    }
}

/// Per-installation ADC calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hw4Calibration {
    pub current_offset: u16,
    pub current_gain: u16,
    pub voltage_gain: u16,
}

impl Default for Hw4Calibration {
    fn default() -> Self {
        Self::from_config(&EscSensorConfig::default())
    }
}

impl Hw4Calibration {
    pub fn from_config(config: &EscSensorConfig) -> Self {
        Self {
            current_offset: config.hw4_current_offset,
            current_gain: config.hw4_current_gain,
            voltage_gain: config.hw4_voltage_gain,
        }
    }

    /// Battery voltage in volts
    pub fn voltage(&self, raw: u16) -> f32 {
        raw as f32 * (V_REF / ADC_RESOLUTION) * (self.voltage_gain as f32 / 10.0)
    }

    /// Motor current in amps, zero at or below the offset
    pub fn current(&self, raw: u16) -> f32 {
        if raw <= self.current_offset {
            return 0.0;
        }

        (raw - self.current_offset) as f32
            * (V_REF / (ADC_RESOLUTION * DIFFAMP_SHUNT * self.current_gain as f32 / 10.0))
    }
}

/// NTC thermistor temperature in °C (beta model), never below zero
pub fn ntc_temperature(raw: u16) -> f32 {
    let voltage = raw as f32 * (V_REF / ADC_RESOLUTION);
    let ntc_r_rref = (voltage / (V_REF - voltage)) * (NTC_R1 / NTC_R_REF);

    if ntc_r_rref < 0.001 {
        return 0.0;
    }

    let temperature = 1.0 / (ntc_r_rref.ln() / NTC_BETA + 1.0 / 298.15) - 273.15;
    if temperature.is_nan() || temperature < 0.0 {
        return 0.0;
    }

    temperature
}

/// HW4 stream parser and decoder
pub struct Hw4Telemetry {
    source: Box<dyn ByteSource>,
    sync: Hw4Synchronizer,
    calibration: Hw4Calibration,
    store: TelemetryStore,
    crc_error_count: u32,
    data_update_us: u64,
    consumption_update_us: u64,
    /// Integrated charge in mA·µs
    total_consumption: f64,
    last_frame: Option<Hw4FrameInfo>,
}

impl std::fmt::Debug for Hw4Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hw4Telemetry")
            .field("sync", &self.sync)
            .field("calibration", &self.calibration)
            .field("crc_error_count", &self.crc_error_count)
            .finish_non_exhaustive()
    }
}

impl Hw4Telemetry {
    pub fn new(source: Box<dyn ByteSource>, calibration: Hw4Calibration) -> Self {
        Self {
            source,
            sync: Hw4Synchronizer::new(),
            calibration,
            store: TelemetryStore::new(),
            crc_error_count: 0,
            data_update_us: 0,
            consumption_update_us: 0,
            total_consumption: 0.0,
            last_frame: None,
        }
    }

    pub fn crc_error_count(&self) -> u32 {
        self.crc_error_count
    }

    fn handle_frame(&mut self, frame: &[u8; HW4_FRAME_SIZE], now_us: u64) {
        let Some(frame) = Hw4Frame::parse(frame) else {
            self.crc_error_count += 1;
            debug!("HW4 frame failed sanity check (total {})", self.crc_error_count);
            return;
        };

        let voltage = self.calibration.voltage(frame.voltage);
        let current = self.calibration.current(frame.current);
        let temp_fet = ntc_temperature(frame.temp_fet);
        let temp_bec = ntc_temperature(frame.temp_bec);

        if let Some(record) = self.store.motor_mut(0) {
            record.data_age = 0;
            record.temperature = temp_fet.round() as i16;
            record.voltage = (voltage * 100.0).round() as i32;
            record.current = (current * 100.0).round() as i32;
            record.rpm = (frame.rpm / 100) as i32;

            // A stopped ESC keeps reporting its last current reading
            if frame.rpm < 100 || frame.throttle < 50 {
                record.current = 0;
            }
        }

        trace!(
            "HW4 frame {}: rpm={} thr={} pwm={} V={:.2} A={:.2} fet={:.1} bec={:.1}",
            frame.counter,
            frame.rpm,
            frame.throttle,
            frame.pwm,
            voltage,
            current,
            temp_fet,
            temp_bec
        );

        self.last_frame = Some(Hw4FrameInfo {
            counter: frame.counter,
            throttle: frame.throttle,
            pwm: frame.pwm,
            raw_rpm: frame.rpm,
            fet_temperature: temp_fet,
            bec_temperature: temp_bec,
        });
        self.data_update_us = now_us;
    }
}

impl TelemetryProtocol for Hw4Telemetry {
    fn protocol(&self) -> EscProtocol {
        EscProtocol::Hw4
    }

    fn process(&mut self, now_us: u64, _motors: &mut dyn MotorDriver) {
        if now_us.saturating_sub(self.data_update_us) > HW4_DATA_AGE_INTERVAL_US {
            self.store.bump_age(0);
            self.data_update_us = now_us;
        }

        while self.source.bytes_available() > 0 {
            let Some(byte) = self.source.read_byte() else {
                break;
            };
            if let Some(frame) = self.sync.push(byte) {
                self.handle_frame(&frame, now_us);
            }
        }

        // Integrate consumption with the last valid current reading
        let current = self.store.motor(0).map_or(0, |record| record.current);
        let elapsed_us = now_us.saturating_sub(self.consumption_update_us);
        self.total_consumption += elapsed_us as f64 * current as f64 * 10.0;
        self.consumption_update_us = now_us;

        if let Some(record) = self.store.motor_mut(0) {
            record.consumption = (self.total_consumption / 3.6e9).round() as i32;
        }
    }

    fn telemetry(&mut self, target: TelemetryTarget, _motor_count: usize) -> Option<MotorTelemetry> {
        match target {
            TelemetryTarget::Motor(0) | TelemetryTarget::Combined => self.store.motor(0).copied(),
            TelemetryTarget::Motor(_) => None,
        }
    }

    fn erpm(&self, motor: usize) -> i32 {
        self.store.motor(motor).map_or(0, |record| record.rpm)
    }

    fn stats(&self) -> EscStats {
        EscStats {
            motor_index: 0,
            timeout_count: 0,
            crc_error_count: self.crc_error_count,
            data_age: self.store.motor(0).map_or(0, |record| record.data_age),
            bytes_buffered: self.sync.bytes_read(),
            hw4_last_frame: self.last_frame,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::esc::DATA_AGE_INVALID;
    use crate::transport::{MockMotorDriver, SliceByteSource};

    /// Frame body after the sync byte: rpm 123400, throttle 500, 1000 raw current
    fn payload() -> [u8; HW4_FRAME_SIZE - 1] {
        let mut body = [0u8; HW4_FRAME_SIZE - 1];
        body[0..3].copy_from_slice(&[0x00, 0x01, 0x02]); // counter 258
        body[3..5].copy_from_slice(&500u16.to_be_bytes()); // throttle
        body[5..7].copy_from_slice(&300u16.to_be_bytes()); // pwm
        body[7..10].copy_from_slice(&123_400u32.to_be_bytes()[1..]); // rpm
        body[10..12].copy_from_slice(&2048u16.to_be_bytes()); // voltage
        body[12..14].copy_from_slice(&1000u16.to_be_bytes()); // current
        body[14..16].copy_from_slice(&1200u16.to_be_bytes()); // FET temp
        body[16..18].copy_from_slice(&1100u16.to_be_bytes()); // BEC temp
        body
    }

    fn frame_bytes() -> Vec<u8> {
        let mut bytes = vec![HW4_SYNC_BYTE];
        bytes.extend_from_slice(&payload());
        bytes
    }

    fn telemetry_for(bytes: &[u8]) -> Hw4Telemetry {
        Hw4Telemetry::new(Box::new(SliceByteSource::new(bytes)), Hw4Calibration::default())
    }

    fn motors() -> MockMotorDriver {
        let mut motors = MockMotorDriver::new();
        motors.expect_motor_count().return_const(1usize);
        motors.expect_motor_is_enabled().return_const(true);
        motors.expect_request_telemetry().never();
        motors
    }

    #[test]
    fn test_sync_assembles_frame() {
        let mut sync = Hw4Synchronizer::new();
        let bytes = frame_bytes();

        for &byte in &bytes[..HW4_FRAME_SIZE - 1] {
            assert!(sync.push(byte).is_none());
        }
        let frame = sync.push(bytes[HW4_FRAME_SIZE - 1]).unwrap();
        assert_eq!(frame.to_vec(), bytes);
        assert_eq!(sync.bytes_read(), 0);
    }

    #[test]
    fn test_sync_ignores_bytes_before_sync_marker() {
        let mut sync = Hw4Synchronizer::new();
        for byte in [0x01, 0x02, 0x03] {
            assert!(sync.push(byte).is_none());
        }
        assert_eq!(sync.bytes_read(), 0);
    }

    #[test]
    fn test_sync_skips_signature_packet() {
        let mut stream = vec![HW4_SYNC_BYTE, HW4_SYNC_BYTE];
        stream.extend_from_slice(&[0x9B, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A]);
        stream.extend_from_slice(&frame_bytes());

        let mut sync = Hw4Synchronizer::new();
        let frames: Vec<_> = stream.iter().filter_map(|&byte| sync.push(byte)).collect();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].to_vec(), frame_bytes());
    }

    #[test]
    fn test_parse_fields() {
        let mut buf = [0u8; HW4_FRAME_SIZE];
        buf.copy_from_slice(&frame_bytes());
        let frame = Hw4Frame::parse(&buf).unwrap();

        assert_eq!(frame.counter, 258);
        assert_eq!(frame.throttle, 500);
        assert_eq!(frame.pwm, 300);
        assert_eq!(frame.rpm, 123_400);
        assert_eq!(frame.voltage, 2048);
        assert_eq!(frame.current, 1000);
        assert_eq!(frame.temp_fet, 1200);
        assert_eq!(frame.temp_bec, 1100);
    }

    #[test]
    fn test_parse_rejects_out_of_range_high_bytes() {
        for (index, bad) in [(4, 4u8), (6, 4), (8, 4), (11, 0x0F), (13, 0x0F), (15, 0x0F), (17, 0x0F)] {
            let mut buf = [0u8; HW4_FRAME_SIZE];
            buf.copy_from_slice(&frame_bytes());
            buf[index] = bad;
            assert!(Hw4Frame::parse(&buf).is_none(), "byte {} = {:#x} accepted", index, bad);
        }
    }

    #[test]
    fn test_voltage_conversion() {
        let cal = Hw4Calibration::default();
        // 2048/4096 * 3.3 * 11 = 18.15 V
        assert!((cal.voltage(2048) - 18.15).abs() < 0.001);
    }

    #[test]
    fn test_current_conversion() {
        let cal = Hw4Calibration::default();
        assert_eq!(cal.current(0), 0.0);
        assert_eq!(cal.current(15), 0.0);
        // (1015 - 15) * 3.3 / (4096 * 0.00025 * 10) = 322.27 A
        assert!((cal.current(1015) - 322.265_63).abs() < 0.01);
    }

    #[test]
    fn test_ntc_temperature() {
        assert_eq!(ntc_temperature(0), 0.0);
        // Ratio of exactly 1 puts the thermistor at its 25 °C reference point
        let raw = (4096.0 * 47.0 / 57.0) as u16;
        assert!((ntc_temperature(raw) - 25.0).abs() < 0.5);
        // Hotter thermistor, lower resistance, lower reading
        assert!(ntc_temperature(1200) > ntc_temperature(raw));
    }

    #[test]
    fn test_decode_stores_converted_values() {
        let mut hw4 = telemetry_for(&frame_bytes());
        hw4.process(1_000, &mut motors());

        let record = hw4.telemetry(TelemetryTarget::Motor(0), 1).unwrap();
        assert_eq!(record.data_age, 0);
        assert_eq!(record.rpm, 1234);
        assert_eq!(record.voltage, 1815);
        assert!(record.current > 0);
        assert_eq!(record.temperature, ntc_temperature(1200).round() as i16);
        assert_eq!(hw4.erpm(0), 1234);

        let info = hw4.stats().hw4_last_frame.unwrap();
        assert_eq!(info.counter, 258);
        assert_eq!(info.throttle, 500);
        assert_eq!(info.pwm, 300);
    }

    #[test]
    fn test_current_forced_to_zero_when_stopped() {
        let mut bytes = frame_bytes();
        bytes[4..6].copy_from_slice(&[0, 0]); // throttle 0
        bytes[8..11].copy_from_slice(&[0, 0, 0]); // rpm 0

        let mut hw4 = telemetry_for(&bytes);
        hw4.process(1_000, &mut motors());

        let record = hw4.telemetry(TelemetryTarget::Motor(0), 1).unwrap();
        assert_eq!(record.data_age, 0);
        assert_eq!(record.current, 0);
    }

    #[test]
    fn test_current_forced_to_zero_at_low_throttle() {
        let mut bytes = frame_bytes();
        bytes[4..6].copy_from_slice(&49u16.to_be_bytes());

        let mut hw4 = telemetry_for(&bytes);
        hw4.process(1_000, &mut motors());
        assert_eq!(hw4.telemetry(TelemetryTarget::Motor(0), 1).unwrap().current, 0);
    }

    #[test]
    fn test_sanity_failure_counts_and_keeps_record() {
        let mut bytes = frame_bytes();
        bytes[11] = 0x0F;

        let mut hw4 = telemetry_for(&bytes);
        hw4.process(1_000, &mut motors());

        assert_eq!(hw4.crc_error_count(), 1);
        let record = hw4.telemetry(TelemetryTarget::Motor(0), 1).unwrap();
        assert_eq!(record.data_age, DATA_AGE_INVALID);
        assert_eq!(record.rpm, 0);
    }

    #[test]
    fn test_data_age_grows_every_250ms_without_frames() {
        let mut hw4 = telemetry_for(&frame_bytes());
        let mut motors = motors();
        hw4.process(1_000, &mut motors);

        hw4.process(251_000, &mut motors);
        assert_eq!(hw4.stats().data_age, 0);
        hw4.process(251_001, &mut motors);
        assert_eq!(hw4.stats().data_age, 1);
        hw4.process(400_000, &mut motors);
        assert_eq!(hw4.stats().data_age, 1);
        hw4.process(501_002, &mut motors);
        assert_eq!(hw4.stats().data_age, 2);
    }

    #[test]
    fn test_consumption_integrates_current() {
        let mut hw4 = telemetry_for(&frame_bytes());
        let mut motors = motors();
        hw4.process(0, &mut motors);

        let current_ca = hw4.telemetry(TelemetryTarget::Motor(0), 1).unwrap().current;
        assert!(current_ca > 0);

        // One hour at this current
        hw4.process(3_600_000_000, &mut motors);
        let consumption = hw4.telemetry(TelemetryTarget::Motor(0), 1).unwrap().consumption;
        let expected = (current_ca as f64 * 10.0).round() as i32;
        assert_eq!(consumption, expected);
    }

    #[test]
    fn test_only_slot_zero_is_exposed() {
        let mut hw4 = telemetry_for(&frame_bytes());
        hw4.process(1_000, &mut motors());

        assert!(hw4.telemetry(TelemetryTarget::Motor(0), 4).is_some());
        assert_eq!(
            hw4.telemetry(TelemetryTarget::Combined, 4),
            hw4.telemetry(TelemetryTarget::Motor(0), 4)
        );
        assert!(hw4.telemetry(TelemetryTarget::Motor(1), 4).is_none());
    }
}

//! # RPM Module
//!
//! Per-motor mechanical RPM for the governor and protections.
//!
//! This module handles:
//! - Choosing one eRPM origin per motor at init
//! - Converting eRPM to mechanical RPM with the motor's pole count
//! - Low-pass filtering the result every tick
//! - The subsystem context tying the ESC sensor and the RPM tracker together

pub mod filter;
pub mod subsystem;

use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::esc::{EscSensor, MAX_MOTORS};
use crate::transport::ErpmSource;

pub use filter::BiquadLpf;
pub use subsystem::RotorRpm;

/// Origin of a motor's eRPM reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum RpmSource {
    #[default]
    None,
    FrequencySensor,
    DshotTelemetry,
    EscSensor,
}

/// The eRPM origins present on this system
#[derive(Default, Clone, Copy)]
pub struct RpmOrigins<'a> {
    pub freq_sensor: Option<&'a dyn ErpmSource>,
    pub dshot: Option<&'a dyn ErpmSource>,
    pub esc_sensor: Option<&'a EscSensor>,
}

impl RpmSource {
    /// Pick the origin for `motor`, most accurate first:
    /// frequency sensor, DSHOT telemetry, ESC sensor.
    pub fn select(motor: usize, config: &Config, origins: &RpmOrigins<'_>) -> Self {
        if config.rpm.freq_sensor_enabled && is_available(origins.freq_sensor, motor) {
            RpmSource::FrequencySensor
        } else if config.motors.protocol_dshot
            && config.motors.use_dshot_telemetry
            && is_available(origins.dshot, motor)
        {
            RpmSource::DshotTelemetry
        } else if config.esc_sensor.enabled && origins.esc_sensor.is_some() {
            RpmSource::EscSensor
        } else {
            RpmSource::None
        }
    }

    /// Read eRPM for `motor` from this origin, `None` when there is no origin
    pub fn query_erpm(&self, motor: usize, origins: &RpmOrigins<'_>) -> Option<i32> {
        match self {
            RpmSource::None => None,
            RpmSource::FrequencySensor => origins.freq_sensor.map(|s| s.erpm(motor)),
            RpmSource::DshotTelemetry => origins.dshot.map(|s| s.erpm(motor)),
            RpmSource::EscSensor => origins.esc_sensor.map(|s| s.erpm(motor)),
        }
    }
}

fn is_available(origin: Option<&dyn ErpmSource>, motor: usize) -> bool {
    origin.is_some_and(|o| o.is_available(motor))
}

/// Pole pairs used to turn eRPM into mechanical RPM
pub fn pole_divisor(pole_count: u16) -> u8 {
    (pole_count / 2).clamp(1, 100) as u8
}

#[derive(Debug, Clone, Copy, Default)]
struct MotorRpm {
    source: RpmSource,
    divisor: u8,
    filter: BiquadLpf,
    erpm: i32,
    raw: f32,
    filtered: f32,
}

/// Raw and filtered RPM of every motor
#[derive(Debug, Clone)]
pub struct RpmTracker {
    motors: [MotorRpm; MAX_MOTORS],
    motor_count: usize,
}

impl RpmTracker {
    /// Resolve sources, divisors and filters for all motor slots
    pub fn new(config: &Config, origins: &RpmOrigins<'_>) -> Self {
        let motors = std::array::from_fn(|motor| {
            let cutoff = config.motors.rpm_lpf_hz_for(motor).clamp(1, 1000);
            MotorRpm {
                source: RpmSource::select(motor, config, origins),
                divisor: pole_divisor(config.motors.pole_count_for(motor)),
                filter: BiquadLpf::new(cutoff as f32, config.rpm.looptime_us),
                ..MotorRpm::default()
            }
        });

        let tracker = Self {
            motors,
            motor_count: config.motors.count.min(MAX_MOTORS),
        };

        for (index, motor) in tracker.motors[..tracker.motor_count].iter().enumerate() {
            info!(
                "Motor {} RPM source {:?}, pole divisor {}",
                index, motor.source, motor.divisor
            );
        }

        tracker
    }

    /// Convert eRPM of `motor` to mechanical RPM
    pub fn mechanical_rpm(&self, motor: usize, erpm: i32) -> f32 {
        let divisor = self.motors.get(motor).map_or(1, |m| m.divisor.max(1));
        100.0 * erpm as f32 / divisor as f32
    }

    /// Fetch, convert and filter the RPM of the first `motor_count` motors
    pub fn update(&mut self, motor_count: usize, origins: &RpmOrigins<'_>) {
        self.motor_count = motor_count.min(MAX_MOTORS);

        for index in 0..self.motor_count {
            let erpm = self.motors[index].source.query_erpm(index, origins).unwrap_or(0);
            let raw = self.mechanical_rpm(index, erpm);

            let motor = &mut self.motors[index];
            motor.erpm = erpm;
            motor.raw = raw;
            motor.filtered = motor.filter.apply(raw);
        }
    }

    /// True only when every motor has an RPM origin
    pub fn is_rpm_source_active(&self) -> bool {
        self.motors[..self.motor_count]
            .iter()
            .all(|m| m.source != RpmSource::None)
    }

    pub fn motor_count(&self) -> usize {
        self.motor_count
    }

    pub fn source(&self, motor: usize) -> RpmSource {
        self.motors.get(motor).map_or(RpmSource::None, |m| m.source)
    }

    pub fn pole_divisor(&self, motor: usize) -> u8 {
        self.motors.get(motor).map_or(1, |m| m.divisor)
    }

    /// Filtered mechanical RPM
    pub fn filtered_rpm(&self, motor: usize) -> f32 {
        self.motors.get(motor).map_or(0.0, |m| m.filtered)
    }

    /// Unfiltered mechanical RPM
    pub fn raw_rpm(&self, motor: usize) -> f32 {
        self.motors.get(motor).map_or(0.0, |m| m.raw)
    }

    /// Filtered RPM rounded to the nearest integer
    pub fn rpm(&self, motor: usize) -> i32 {
        self.filtered_rpm(motor).round() as i32
    }

    /// eRPM fetched on the last update
    pub fn electrical_rpm(&self, motor: usize) -> i32 {
        self.motors.get(motor).map_or(0, |m| m.erpm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockErpmSource;

    fn config(count: usize) -> Config {
        let mut config = Config::default();
        config.motors.count = count;
        config.esc_sensor.enabled = false;
        config
    }

    fn freq_sensor(ready: &'static [usize], erpm: i32) -> MockErpmSource {
        let mut sensor = MockErpmSource::new();
        sensor.expect_is_available().returning(move |m| ready.contains(&m));
        sensor.expect_erpm().return_const(erpm);
        sensor
    }

    #[test]
    fn test_pole_divisor_clamps() {
        let divisors: Vec<u8> = [2u16, 4, 6, 200].iter().map(|&p| pole_divisor(p)).collect();
        assert_eq!(divisors, vec![1, 2, 3, 100]);
        assert_eq!(pole_divisor(0), 1);
        assert_eq!(pole_divisor(1), 1);
        assert_eq!(pole_divisor(u16::MAX), 100);
    }

    #[test]
    fn test_no_origins_selects_none() {
        let config = config(2);
        let tracker = RpmTracker::new(&config, &RpmOrigins::default());
        assert_eq!(tracker.source(0), RpmSource::None);
        assert!(!tracker.is_rpm_source_active());
    }

    #[test]
    fn test_frequency_sensor_has_priority_over_dshot() {
        let mut config = config(1);
        config.rpm.freq_sensor_enabled = true;
        config.motors.protocol_dshot = true;
        config.motors.use_dshot_telemetry = true;

        let freq = freq_sensor(&[0], 1000);
        let dshot = freq_sensor(&[0], 2000);
        let origins = RpmOrigins {
            freq_sensor: Some(&freq),
            dshot: Some(&dshot),
            esc_sensor: None,
        };

        assert_eq!(RpmSource::select(0, &config, &origins), RpmSource::FrequencySensor);
    }

    #[test]
    fn test_dshot_needs_dshot_protocol_and_telemetry() {
        let mut config = config(1);
        config.motors.use_dshot_telemetry = true;

        let dshot = freq_sensor(&[0], 2000);
        let origins = RpmOrigins {
            freq_sensor: None,
            dshot: Some(&dshot),
            esc_sensor: None,
        };

        assert_eq!(RpmSource::select(0, &config, &origins), RpmSource::None);
        config.motors.protocol_dshot = true;
        assert_eq!(RpmSource::select(0, &config, &origins), RpmSource::DshotTelemetry);
    }

    #[test]
    fn test_disabled_freq_sensor_falls_through() {
        let mut config = config(1);
        config.motors.protocol_dshot = true;
        config.motors.use_dshot_telemetry = true;

        let freq = freq_sensor(&[0], 1000);
        let dshot = freq_sensor(&[0], 2000);
        let origins = RpmOrigins {
            freq_sensor: Some(&freq),
            dshot: Some(&dshot),
            esc_sensor: None,
        };

        assert_eq!(RpmSource::select(0, &config, &origins), RpmSource::DshotTelemetry);
    }

    #[test]
    fn test_source_active_requires_every_motor() {
        let mut config = config(3);
        config.rpm.freq_sensor_enabled = true;

        let all_ready = freq_sensor(&[0, 1, 2], 0);
        let tracker = RpmTracker::new(&config, &RpmOrigins {
            freq_sensor: Some(&all_ready),
            ..RpmOrigins::default()
        });
        assert!(tracker.is_rpm_source_active());

        let motor_two_missing = freq_sensor(&[0, 1], 0);
        let tracker = RpmTracker::new(&config, &RpmOrigins {
            freq_sensor: Some(&motor_two_missing),
            ..RpmOrigins::default()
        });
        assert_eq!(tracker.source(2), RpmSource::None);
        assert!(!tracker.is_rpm_source_active());
    }

    #[test]
    fn test_update_converts_erpm() {
        let mut config = config(1);
        config.rpm.freq_sensor_enabled = true;
        config.motors.pole_count = vec![14];

        let sensor = freq_sensor(&[0], 350);
        let origins = RpmOrigins {
            freq_sensor: Some(&sensor),
            ..RpmOrigins::default()
        };
        let mut tracker = RpmTracker::new(&config, &origins);
        tracker.update(1, &origins);

        assert_eq!(tracker.pole_divisor(0), 7);
        assert_eq!(tracker.electrical_rpm(0), 350);
        assert_eq!(tracker.raw_rpm(0), 5000.0);
        assert!(tracker.filtered_rpm(0) > 0.0 && tracker.filtered_rpm(0) < 5000.0);
    }

    #[test]
    fn test_filtered_rpm_converges() {
        let mut config = config(1);
        config.rpm.freq_sensor_enabled = true;
        config.motors.pole_count = vec![2];

        let sensor = freq_sensor(&[0], 30);
        let origins = RpmOrigins {
            freq_sensor: Some(&sensor),
            ..RpmOrigins::default()
        };
        let mut tracker = RpmTracker::new(&config, &origins);
        for _ in 0..2000 {
            tracker.update(1, &origins);
        }

        assert_eq!(tracker.raw_rpm(0), 3000.0);
        assert_eq!(tracker.rpm(0), 3000);
    }

    #[test]
    fn test_motor_without_source_reads_zero() {
        let config = config(1);
        let mut tracker = RpmTracker::new(&config, &RpmOrigins::default());
        tracker.update(1, &RpmOrigins::default());

        assert_eq!(tracker.electrical_rpm(0), 0);
        assert_eq!(tracker.raw_rpm(0), 0.0);
        assert_eq!(tracker.filtered_rpm(0), 0.0);
    }

    #[test]
    fn test_out_of_range_motor_queries() {
        let tracker = RpmTracker::new(&config(1), &RpmOrigins::default());
        assert_eq!(tracker.source(MAX_MOTORS), RpmSource::None);
        assert_eq!(tracker.raw_rpm(MAX_MOTORS), 0.0);
        assert_eq!(tracker.rpm(MAX_MOTORS), 0);
    }
}

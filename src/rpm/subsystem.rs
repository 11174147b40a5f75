//! RPM acquisition subsystem context.
//!
//! Owns the ESC sensor, the external eRPM origins and the RPM tracker, and
//! answers the queries the governor and protections make.

use super::{RpmOrigins, RpmSource, RpmTracker};
use crate::config::Config;
use crate::esc::{EscSensor, EscStats, MotorTelemetry, TelemetryTarget};
use crate::transport::{ErpmSource, MotorDriver};

/// RPM acquisition subsystem
pub struct RotorRpm {
    esc_sensor_enabled: bool,
    esc: Option<EscSensor>,
    freq_sensor: Option<Box<dyn ErpmSource>>,
    dshot: Option<Box<dyn ErpmSource>>,
    tracker: RpmTracker,
}

impl std::fmt::Debug for RotorRpm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotorRpm")
            .field("esc", &self.esc)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl RotorRpm {
    /// Build the subsystem and resolve each motor's RPM source
    ///
    /// `esc` is `None` when the ESC sensor failed to initialize or has no
    /// transport; the other origins are `None` when not fitted.
    pub fn new(
        config: &Config,
        esc: Option<EscSensor>,
        freq_sensor: Option<Box<dyn ErpmSource>>,
        dshot: Option<Box<dyn ErpmSource>>,
    ) -> Self {
        let tracker = {
            let origins = RpmOrigins {
                freq_sensor: freq_sensor.as_deref(),
                dshot: dshot.as_deref(),
                esc_sensor: esc.as_ref(),
            };
            RpmTracker::new(config, &origins)
        };

        Self {
            esc_sensor_enabled: config.esc_sensor.enabled,
            esc,
            freq_sensor,
            dshot,
            tracker,
        }
    }

    /// One scheduler tick: poll ESC telemetry, then refresh every motor's RPM
    pub fn tick(&mut self, now_us: u64, motors: &mut dyn MotorDriver) {
        if let Some(esc) = self.esc.as_mut() {
            esc.process(now_us, motors);
        }

        let origins = RpmOrigins {
            freq_sensor: self.freq_sensor.as_deref(),
            dshot: self.dshot.as_deref(),
            esc_sensor: self.esc.as_ref(),
        };
        self.tracker.update(motors.motor_count(), &origins);
    }

    /// True only when every motor has an RPM origin
    pub fn is_rpm_source_active(&self) -> bool {
        self.tracker.is_rpm_source_active()
    }

    /// True when the ESC sensor has a working transport
    pub fn is_esc_sensor_active(&self) -> bool {
        self.esc.is_some()
    }

    pub fn filtered_rpm(&self, motor: usize) -> f32 {
        self.tracker.filtered_rpm(motor)
    }

    pub fn raw_rpm(&self, motor: usize) -> f32 {
        self.tracker.raw_rpm(motor)
    }

    pub fn rpm(&self, motor: usize) -> i32 {
        self.tracker.rpm(motor)
    }

    pub fn raw_rpm_rounded(&self, motor: usize) -> i32 {
        self.tracker.raw_rpm(motor).round() as i32
    }

    pub fn electrical_rpm(&self, motor: usize) -> i32 {
        self.tracker.electrical_rpm(motor)
    }

    pub fn source(&self, motor: usize) -> RpmSource {
        self.tracker.source(motor)
    }

    pub fn motor_count(&self) -> usize {
        self.tracker.motor_count()
    }

    /// ESC telemetry record, `None` when the ESC sensor is off or `target`
    /// is not valid for the active protocol
    pub fn telemetry(&mut self, target: TelemetryTarget) -> Option<MotorTelemetry> {
        if !self.esc_sensor_enabled {
            return None;
        }

        let motor_count = self.tracker.motor_count();
        self.esc.as_mut()?.telemetry(target, motor_count)
    }

    pub fn esc_stats(&self) -> Option<EscStats> {
        self.esc.as_ref().map(EscSensor::stats)
    }
}

//! # Rotor RPM Bench Monitor
//!
//! Reads ESC serial telemetry on a host serial port and prints the resulting
//! per-motor RPM, optionally logging debug records to JSONL files.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use rotor_rpm::config::{Config, EscProtocol};
use rotor_rpm::esc::{EscSensor, EscTransport, TelemetryTarget};
use rotor_rpm::rpm::RotorRpm;
use rotor_rpm::telemetry::{DebugRecord, JsonlLogger};
use rotor_rpm::transport::serial::{pump_into_channel, pump_into_frame_buffer, ChannelByteSource, EscSerial};
use rotor_rpm::transport::{FrameBuffer, MotorDriver};

/// Config file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Motor output stand-in for a bench without a flight controller
///
/// Telemetry requests ride on the motor protocol in flight; here they are
/// only logged, the ESC is expected to answer on its own schedule.
#[derive(Debug)]
struct BenchMotors {
    count: usize,
    enabled: bool,
}

impl MotorDriver for BenchMotors {
    fn motor_count(&self) -> usize {
        self.count
    }

    fn motor_is_enabled(&self) -> bool {
        self.enabled
    }

    fn request_telemetry(&mut self, motor: usize) {
        debug!("Telemetry request for motor {}", motor);
    }
}

/// Tick period for the configured update rate
fn tick_period(update_hz: u32) -> Duration {
    Duration::from_micros(1_000_000 / u64::from(update_hz.max(1)))
}

/// Open the ESC port and start the matching receive pump
fn open_transport(config: &Config) -> Option<EscTransport> {
    if !config.esc_sensor.enabled {
        info!("ESC sensor disabled in config");
        return None;
    }

    let protocol = config.esc_sensor.protocol;
    let serial = match EscSerial::open(&config.serial.port, protocol, config.serial.half_duplex) {
        Ok(serial) => serial,
        Err(e) => {
            warn!("ESC telemetry port unavailable: {}", e);
            return None;
        }
    };
    info!("ESC telemetry port opened at: {}", serial.device_path());

    let stream = serial.into_stream();
    match protocol {
        EscProtocol::Kiss => {
            let buffer = Arc::new(FrameBuffer::new());
            let pump_buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                match pump_into_frame_buffer(stream, pump_buffer).await {
                    Ok(total) => info!("ESC port closed after {} bytes", total),
                    Err(e) => warn!("ESC receive pump stopped: {}", e),
                }
            });
            Some(EscTransport::Kiss(buffer))
        }
        EscProtocol::Hw4 => {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                match pump_into_channel(stream, tx).await {
                    Ok(total) => info!("ESC port closed after {} bytes", total),
                    Err(e) => warn!("ESC receive pump stopped: {}", e),
                }
            });
            Some(EscTransport::Hw4(Box::new(ChannelByteSource::new(rx))))
        }
    }
}

fn log_status(rpm: &mut RotorRpm) {
    for motor in 0..rpm.motor_count() {
        info!(
            "Motor {}: {} rpm (raw {}, eRPM {}, source {:?})",
            motor,
            rpm.rpm(motor),
            rpm.raw_rpm_rounded(motor),
            rpm.electrical_rpm(motor),
            rpm.source(motor)
        );
    }

    if let Some(combined) = rpm.telemetry(TelemetryTarget::Combined) {
        info!(
            "ESC: {:.2} V, {:.2} A, {} mAh, {} °C, age {}",
            combined.voltage as f32 / 100.0,
            combined.current as f32 / 100.0,
            combined.consumption,
            combined.temperature,
            combined.data_age
        );
    }

    if let Some(stats) = rpm.esc_stats() {
        debug!(
            "ESC stats: motor {}, {} timeouts, {} CRC errors",
            stats.motor_index, stats.timeout_count, stats.crc_error_count
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let (writer, _log_guard) = tracing_appender::non_blocking(std::io::stderr());
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
        )
        .init();

    info!("Rotor RPM v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    info!("Loaded config from {}", config_path);

    let esc = match EscSensor::init(&config.esc_sensor, open_transport(&config)) {
        Ok(esc) => Some(esc),
        Err(e) => {
            warn!("ESC sensor inactive: {}", e);
            None
        }
    };

    // No frequency sensor or DSHOT telemetry on a host
    let mut rpm = RotorRpm::new(&config, esc, None, None);
    if !rpm.is_rpm_source_active() {
        warn!("Not every motor has an RPM source");
    }

    let mut logger = if config.telemetry.enabled {
        Some(JsonlLogger::new(&config.telemetry)?)
    } else {
        None
    };

    let mut motors = BenchMotors {
        count: config.motors.count,
        enabled: config.motors.enabled,
    };

    let mut ticker = interval(tick_period(config.esc_sensor.update_hz));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let status_period = Duration::from_millis(config.telemetry.log_interval_ms.max(1));

    info!("Starting RPM loop at {}Hz", config.esc_sensor.update_hz);
    info!("Press Ctrl+C to exit");

    let start = Instant::now();
    let mut last_status = start;
    let mut tick_count: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now_us = start.elapsed().as_micros() as u64;
                rpm.tick(now_us, &mut motors);
                tick_count += 1;

                if last_status.elapsed() >= status_period {
                    last_status = Instant::now();
                    log_status(&mut rpm);

                    if let Some(logger) = logger.as_mut() {
                        let record = DebugRecord::capture(&mut rpm);
                        if let Err(e) = logger.log(&record) {
                            warn!("Failed to write telemetry record: {}", e);
                        }
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                info!("Total ticks: {}", tick_count);
                break;
            }
        }
    }

    if let Some(logger) = logger.as_mut() {
        logger.flush()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_period() {
        assert_eq!(tick_period(1000), Duration::from_millis(1));
        assert_eq!(tick_period(250), Duration::from_millis(4));
        assert_eq!(tick_period(0), Duration::from_secs(1));
    }

    #[test]
    fn test_default_config_path() {
        assert_eq!(DEFAULT_CONFIG_PATH, "config/default.toml");
    }

    #[test]
    fn test_bench_motors() {
        let mut motors = BenchMotors { count: 2, enabled: true };
        motors.request_telemetry(1);
        assert_eq!(motors.motor_count(), 2);
        assert!(motors.motor_is_enabled());
    }

    #[test]
    fn test_disabled_esc_sensor_opens_nothing() {
        let mut config = Config::default();
        config.esc_sensor.enabled = false;
        assert!(open_transport(&config).is_none());
    }
}

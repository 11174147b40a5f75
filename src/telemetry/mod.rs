//! # Telemetry Module
//!
//! Debug snapshots of the RPM subsystem, logged to JSONL files with rotation.
//!
//! This module handles:
//! - Capturing per-motor RPM, eRPM and ESC telemetry into a [`DebugRecord`]
//! - Formatting as JSONL (JSON Lines)
//! - Writing to rotating log files (max N records per file)
//! - Retaining only the last M files

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::TelemetryConfig;
use crate::error::{Result, RotorRpmError};
use crate::esc::{EscStats, MotorTelemetry, TelemetryTarget};
use crate::rpm::{RotorRpm, RpmSource};

const LOG_FILE_PREFIX: &str = "rotor_rpm_";
const LOG_FILE_SUFFIX: &str = ".jsonl";

/// RPM state of one motor at capture time
#[derive(Debug, Clone, Serialize)]
pub struct MotorSnapshot {
    pub motor: usize,
    pub source: RpmSource,
    pub erpm: i32,
    pub raw_rpm: f32,
    pub filtered_rpm: f32,
    pub telemetry: Option<MotorTelemetry>,
}

/// One line of the debug log
#[derive(Debug, Clone, Serialize)]
pub struct DebugRecord {
    pub timestamp: DateTime<Utc>,
    pub motors: Vec<MotorSnapshot>,
    pub combined: Option<MotorTelemetry>,
    pub esc: Option<EscStats>,
}

impl DebugRecord {
    /// Snapshot every active motor of `rpm`
    pub fn capture(rpm: &mut RotorRpm) -> Self {
        let motors = (0..rpm.motor_count())
            .map(|motor| MotorSnapshot {
                motor,
                source: rpm.source(motor),
                erpm: rpm.electrical_rpm(motor),
                raw_rpm: rpm.raw_rpm(motor),
                filtered_rpm: rpm.filtered_rpm(motor),
                telemetry: rpm.telemetry(TelemetryTarget::Motor(motor)),
            })
            .collect();

        Self {
            timestamp: Utc::now(),
            motors,
            combined: rpm.telemetry(TelemetryTarget::Combined),
            esc: rpm.esc_stats(),
        }
    }
}

/// JSON Lines writer with size-based rotation
///
/// Files are named `rotor_rpm_<session start>_<index>.jsonl`, so lexical order
/// is creation order and pruning removes the oldest first.
#[derive(Debug)]
pub struct JsonlLogger {
    dir: PathBuf,
    session: String,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    writer: Option<BufWriter<File>>,
    records_in_file: usize,
    file_index: u32,
}

impl JsonlLogger {
    /// Create the log directory if needed
    ///
    /// # Errors
    ///
    /// Returns [`RotorRpmError::Io`] if the directory cannot be created.
    pub fn new(config: &TelemetryConfig) -> Result<Self> {
        let dir = PathBuf::from(&config.log_dir);
        fs::create_dir_all(&dir)?;

        info!("Telemetry log directory: {}", dir.display());

        Ok(Self {
            dir,
            session: Utc::now().format("%Y%m%d_%H%M%S").to_string(),
            max_records_per_file: config.max_records_per_file.max(1),
            max_files_to_keep: config.max_files_to_keep.max(1),
            writer: None,
            records_in_file: 0,
            file_index: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append one record as a JSON line, rotating first when the file is full
    pub fn log<T: Serialize>(&mut self, record: &T) -> Result<()> {
        if self.writer.is_none() || self.records_in_file >= self.max_records_per_file {
            self.rotate()?;
        }

        let Some(writer) = self.writer.as_mut() else {
            return Err(RotorRpmError::Logger("no open log file".to_string()));
        };

        serde_json::to_writer(&mut *writer, record)
            .map_err(|e| RotorRpmError::Logger(format!("Failed to encode record: {}", e)))?;
        writer.write_all(b"\n")?;
        self.records_in_file += 1;

        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        let path = self.dir.join(format!(
            "{}{}_{:04}{}",
            LOG_FILE_PREFIX, self.session, self.file_index, LOG_FILE_SUFFIX
        ));
        let file = File::create(&path)?;
        debug!("Opened telemetry log {}", path.display());

        self.writer = Some(BufWriter::new(file));
        self.records_in_file = 0;
        self.file_index += 1;

        self.prune()
    }

    fn prune(&self) -> Result<()> {
        let mut logs = self.log_files()?;
        if logs.len() <= self.max_files_to_keep {
            return Ok(());
        }

        let excess = logs.len() - self.max_files_to_keep;
        for path in logs.drain(..excess) {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove old telemetry log {}: {}", path.display(), e);
            }
        }
        Ok(())
    }

    /// Log files in the directory, oldest first
    pub fn log_files(&self) -> Result<Vec<PathBuf>> {
        let mut logs: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX) && name.ends_with(LOG_FILE_SUFFIX))
            })
            .collect();
        logs.sort();
        Ok(logs)
    }
}

impl Drop for JsonlLogger {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("Failed to flush telemetry log: {}", e);
        }
    }
}

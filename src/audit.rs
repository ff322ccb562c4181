//! CSV audit log of telemetry ticks.
//!
//! While enabled, every telemetry tick appends one row combining the CDS sample
//! with the latest sink power readback. The logger has no timer of its own:
//! its rate follows the telemetry cadence. Each enable creates a new file
//! named after the current time and writes the header; rows are appended with
//! the file reopened per row, so a failed write doesn't disable logging.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

use crate::error::{BenchError, BenchResult};
use crate::scpi::SinkPowerReading;
use crate::telemetry::TelemetrySample;

/// Column names of every audit file
pub const CSV_HEADER: [&str; 6] = [
    "Timestamp",
    "CDS_Power_W",
    "CDS_Voltage_V",
    "CDS_Current_A",
    "Sink_Power_W",
    "Sink_Success",
];

/// Current logging session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CsvLogSession {
    /// Rows are written only while enabled
    pub enabled: bool,
    /// File of the active session
    pub file_path: Option<PathBuf>,
}

/// Snapshot returned by [`CsvAuditLogger::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CsvLoggingStatus {
    /// Whether rows are being written
    pub enabled: bool,
    /// File of the active session
    pub file_path: Option<PathBuf>,
    /// Whether that file is present on disk
    pub file_exists: bool,
}

/// File name for a session started at `now`, e.g.
/// `measurements_2026-10-18T09-30-12-345Z.csv`.
pub fn file_name_for(now: DateTime<Utc>) -> String {
    let stamp = now
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("measurements_{stamp}.csv")
}

/// CSV audit logger with a single session at a time.
#[derive(Debug)]
pub struct CsvAuditLogger {
    output_dir: PathBuf,
    session: Mutex<CsvLogSession>,
}

impl CsvAuditLogger {
    /// Logger writing files into `output_dir` (created on first start)
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            session: Mutex::new(CsvLogSession::default()),
        }
    }

    fn session(&self) -> MutexGuard<'_, CsvLogSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a session: create the file, write the header, enable logging.
    ///
    /// Fails with [`BenchError::CsvLoggingActive`] if a session is running,
    /// and leaves logging disabled if the file cannot be created.
    pub fn start(&self) -> BenchResult<PathBuf> {
        let mut session = self.session();
        if session.enabled {
            let active = session
                .file_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return Err(BenchError::CsvLoggingActive(active));
        }

        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.unused_path(Utc::now());

        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(CSV_HEADER)?;
        writer.flush()?;

        session.enabled = true;
        session.file_path = Some(path.clone());
        info!(path = %path.display(), "CSV logging started");
        Ok(path)
    }

    fn unused_path(&self, now: DateTime<Utc>) -> PathBuf {
        let name = file_name_for(now);
        let candidate = self.output_dir.join(&name);
        if !candidate.exists() {
            return candidate;
        }

        let stem = name.trim_end_matches(".csv");
        (1u32..)
            .map(|n| self.output_dir.join(format!("{stem}_{n}.csv")))
            .find(|path| !path.exists())
            .unwrap_or(candidate)
    }

    /// Stop the session and return the file it was writing, if any.
    pub fn stop(&self) -> Option<PathBuf> {
        let mut session = self.session();
        session.enabled = false;
        let path = session.file_path.take();
        info!(path = ?path, "CSV logging stopped");
        path
    }

    /// Enabled flag, file path and whether the file exists
    pub fn status(&self) -> CsvLoggingStatus {
        let session = self.session();
        CsvLoggingStatus {
            enabled: session.enabled,
            file_exists: session.file_path.as_ref().is_some_and(|p| p.exists()),
            file_path: session.file_path.clone(),
        }
    }

    /// True while a session is running
    pub fn is_enabled(&self) -> bool {
        self.session().enabled
    }

    /// Append one row. A no-op while disabled.
    ///
    /// Sink power is left empty unless the last readback succeeded.
    pub fn log_row(&self, sample: &TelemetrySample, sink: &SinkPowerReading) -> BenchResult<()> {
        let session = self.session();
        let Some(path) = session.file_path.as_ref().filter(|_| session.enabled) else {
            return Ok(());
        };

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let sink_power = if sink.successful { sink.msg.as_str() } else { "" };
        let sink_success = if sink.successful { "true" } else { "false" };

        let power = sample.power_w.to_string();
        let voltage = sample.voltage_v.to_string();
        let current = sample.current_a.to_string();

        let file = OpenOptions::new().append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record([
            timestamp.as_str(),
            power.as_str(),
            voltage.as_str(),
            current.as_str(),
            sink_power,
            sink_success,
        ])?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::path::Path;

    fn sample() -> TelemetrySample {
        TelemetrySample {
            voltage_v: 230,
            current_a: 16,
            power_w: 3680,
            timestamp: None,
        }
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn file_name_replaces_separators() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 12).unwrap();
        assert_eq!(
            file_name_for(now),
            "measurements_2026-10-18T09-30-12-000Z.csv"
        );
    }

    #[test]
    fn header_plus_one_row_per_tick() {
        let dir = tempfile::tempdir().unwrap();
        let logger = CsvAuditLogger::new(dir.path().join("logs"));
        let path = logger.start().unwrap();

        let sink = SinkPowerReading {
            successful: true,
            msg: "3650.5".into(),
        };
        logger.log_row(&sample(), &sink).unwrap();
        logger.log_row(&sample(), &SinkPowerReading::default()).unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "Timestamp,CDS_Power_W,CDS_Voltage_V,CDS_Current_A,Sink_Power_W,Sink_Success"
        );
        assert!(lines[1].ends_with(",3680,230,16,3650.5,true"));
        assert!(lines[2].ends_with(",3680,230,16,,false"));
    }

    #[test]
    fn rows_ignored_while_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let logger = CsvAuditLogger::new(dir.path());
        logger
            .log_row(&sample(), &SinkPowerReading::default())
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let path = logger.start().unwrap();
        assert_eq!(logger.stop(), Some(path.clone()));
        logger
            .log_row(&sample(), &SinkPowerReading::default())
            .unwrap();
        assert_eq!(read_lines(&path).len(), 1);
    }

    #[test]
    fn restart_creates_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = CsvAuditLogger::new(dir.path());

        let first = logger.start().unwrap();
        logger.log_row(&sample(), &SinkPowerReading::default()).unwrap();
        logger.stop();

        let second = logger.start().unwrap();
        assert_ne!(first, second);
        assert_eq!(read_lines(&first).len(), 2);
        assert_eq!(read_lines(&second).len(), 1);
    }

    #[test]
    fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let logger = CsvAuditLogger::new(dir.path());
        let path = logger.start().unwrap();

        assert!(matches!(logger.start(), Err(BenchError::CsvLoggingActive(_))));
        assert_eq!(logger.status().file_path, Some(path));
    }

    #[test]
    fn status_reports_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = CsvAuditLogger::new(dir.path());
        assert_eq!(
            logger.status(),
            CsvLoggingStatus {
                enabled: false,
                file_path: None,
                file_exists: false
            }
        );

        logger.start().unwrap();
        let status = logger.status();
        assert!(status.enabled);
        assert!(status.file_exists);
    }

    #[test]
    fn write_failure_keeps_logging_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let logger = CsvAuditLogger::new(dir.path());
        let path = logger.start().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(logger
            .log_row(&sample(), &SinkPowerReading::default())
            .is_err());
        assert!(logger.is_enabled());
    }
}

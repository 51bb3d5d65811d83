//! Per-item timing diagnostics, one CSV row per written item.

use crate::error::{AppResult, RecorderError};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Column names, in order.
pub const TIMING_HEADER: [&str; 12] = [
    "frame_index",
    "sequence",
    "capture_time",
    "write_time",
    "expected_interval_ms",
    "actual_interval_ms",
    "interval_error_ms",
    "queue_delay_ms",
    "write_duration_ms",
    "queue_depth_after_write",
    "is_duplicate",
    "tick_lag_ms",
];

/// One row of the timing log.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TimingRow {
    /// Position in the output stream
    pub frame_index: u64,
    /// Device sequence number of the payload
    pub sequence: u64,
    /// Capture timestamp (RFC 3339)
    pub capture_time: String,
    /// Wall clock at write start (RFC 3339)
    pub write_time: String,
    /// Nominal tick interval
    pub expected_interval_ms: f64,
    /// Measured interval since the previous tick; empty for the first item
    pub actual_interval_ms: Option<f64>,
    /// `actual - expected`; empty for the first item
    pub interval_error_ms: Option<f64>,
    /// `write_start - enqueue_time`
    pub queue_delay_ms: f64,
    /// Time spent in the sink
    pub write_duration_ms: f64,
    /// Queue depth right after the write
    pub queue_depth_after_write: usize,
    /// Payload reused from the previous tick
    pub is_duplicate: bool,
    /// Capture-to-write latency
    pub tick_lag_ms: f64,
}

type CsvFile = csv::Writer<BufWriter<File>>;

/// Thread-safe timing CSV. Rows recorded after `close` are ignored.
#[derive(Debug)]
pub struct TimingLog {
    path: PathBuf,
    writer: Mutex<Option<CsvFile>>,
    rows: AtomicU64,
}

impl TimingLog {
    /// Create the file (and its directory) and write the header.
    pub fn create(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = File::create(&path).map_err(|e| {
            RecorderError::Pipeline(format!(
                "Failed to create timing log at {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(file));
        writer.write_record(TIMING_HEADER)?;

        Ok(Self {
            path,
            writer: Mutex::new(Some(writer)),
            rows: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<CsvFile>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a row. Returns false when the log is already closed.
    pub fn record(&self, row: &TimingRow) -> AppResult<bool> {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(writer) => {
                writer.serialize(row)?;
                self.rows.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Push buffered rows to disk.
    pub fn flush(&self) -> AppResult<()> {
        if let Some(writer) = self.lock().as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Flush and close; idempotent. Returns the number of data rows written.
    pub fn close(&self) -> AppResult<u64> {
        if let Some(mut writer) = self.lock().take() {
            writer.flush()?;
        }
        Ok(self.rows())
    }

    /// Data rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    /// Location of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

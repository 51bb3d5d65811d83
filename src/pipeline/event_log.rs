//! Append-only log for event streams (gaze, IMU, GPS fixes, task events).
//!
//! Records are buffered in a bounded drop-oldest queue and written to CSV by a
//! periodic flush. Unlike the paced media stream nothing is ever duplicated.

use crate::core::EventRecord;
use crate::error::{AppResult, RecorderError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Counters of one event log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogStats {
    /// Records pushed by the capture thread
    pub received: u64,
    /// Records written to disk
    pub written: u64,
    /// Records evicted from a full buffer
    pub dropped: u64,
}

#[derive(Serialize)]
struct EventRow<'a> {
    capture_time: String,
    channel: &'a str,
    values: String,
}

type CsvFile = csv::Writer<BufWriter<File>>;

/// Bounded, periodically flushed event log.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    capacity: usize,
    buffer: Mutex<VecDeque<EventRecord>>,
    writer: Mutex<Option<CsvFile>>,
    received: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventLog {
    /// Create the CSV file with its header.
    pub fn create(path: impl AsRef<Path>, capacity: usize) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path).map_err(|e| {
            RecorderError::Pipeline(format!(
                "Failed to create event log at {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(BufWriter::new(file));
        writer.write_record(["capture_time", "channel", "values"])?;

        Ok(Self {
            path,
            capacity: capacity.max(1),
            buffer: Mutex::new(VecDeque::new()),
            writer: Mutex::new(Some(writer)),
            received: AtomicU64::new(0),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Buffer a record. Returns false when the oldest record had to be evicted.
    pub fn push(&self, record: EventRecord) -> bool {
        self.received.fetch_add(1, Ordering::Relaxed);
        let mut buffer = lock(&self.buffer);
        let evicted = if buffer.len() >= self.capacity {
            buffer.pop_front();
            true
        } else {
            false
        };
        buffer.push_back(record);
        drop(buffer);

        if evicted {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if crate::pipeline::work_queue::should_log_overflow(dropped) {
                warn!(path = %self.path.display(), dropped, "Event buffer full, evicted oldest record");
            }
        }
        !evicted
    }

    /// Write everything buffered so far. Returns the number of records written.
    pub fn flush(&self) -> AppResult<usize> {
        let pending: Vec<EventRecord> = lock(&self.buffer).drain(..).collect();
        let mut guard = lock(&self.writer);
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            None => return Ok(0),
        };

        for record in &pending {
            let values = record
                .values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(";");
            writer.serialize(EventRow {
                capture_time: record.captured_at.to_rfc3339(),
                channel: &record.channel,
                values,
            })?;
        }
        writer.flush()?;
        self.written.fetch_add(pending.len() as u64, Ordering::Relaxed);
        Ok(pending.len())
    }

    /// Final flush, then close. Idempotent.
    pub fn close(&self) -> AppResult<EventLogStats> {
        self.flush()?;
        lock(&self.writer).take();
        Ok(self.stats())
    }

    /// Current counters.
    pub fn stats(&self) -> EventLogStats {
        EventLogStats {
            received: self.received.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Location of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush every `interval` on the blocking pool until the returned sender fires.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        interval: Duration,
    ) -> (oneshot::Sender<()>, JoinHandle<()>) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let log = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let log = Arc::clone(&log);
                        match tokio::task::spawn_blocking(move || log.flush()).await {
                            Ok(Ok(n)) if n > 0 => debug!(records = n, "Flushed event log"),
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!(error = %e, "Event log flush failed"),
                            Err(e) => warn!(error = %e, "Event log flush task failed"),
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });

        (stop_tx, task)
    }
}

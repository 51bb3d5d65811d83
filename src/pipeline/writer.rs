//! Single-consumer writer thread.
//!
//! The writer runs on its own OS thread so that a slow disk or encoder pipe
//! can never delay the pacer. It pops items in FIFO order, writes them through
//! a [`SampleSink`], and appends one timing row per written item.

use crate::error::{AppResult, RecorderError};
use crate::pipeline::timing_log::{TimingLog, TimingRow};
use crate::pipeline::work_queue::WorkQueue;
use crate::pipeline::{PipelineCounters, QueuedItem};
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Destination of recorded payloads (file, encoder pipe, ...).
pub trait SampleSink: Send {
    /// Write one item. Errors are counted and the writer moves on.
    fn write(&mut self, item: &QueuedItem) -> AppResult<()>;

    /// Flush and release the destination.
    fn finish(&mut self) -> AppResult<()>;
}

/// Appends raw payload bytes to a file.
#[derive(Debug)]
pub struct RawFileSink {
    path: PathBuf,
    file: BufWriter<File>,
}

impl RawFileSink {
    /// Create (truncate) `path`, creating parent directories.
    pub fn create(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| {
                RecorderError::Pipeline(format!(
                    "Failed to open output {}: {}",
                    path.display(),
                    e
                ))
            })?;

        Ok(Self {
            path,
            file: BufWriter::new(file),
        })
    }

    /// Output location.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SampleSink for RawFileSink {
    fn write(&mut self, item: &QueuedItem) -> AppResult<()> {
        self.file.write_all(&item.payload)?;
        Ok(())
    }

    fn finish(&mut self) -> AppResult<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }
}

/// Called once when consecutive write failures reach the threshold.
pub type FaultHandler = Box<dyn Fn(String) + Send + 'static>;

/// Everything the writer thread needs.
pub struct WriterTask {
    /// Source of items
    pub queue: Arc<WorkQueue<QueuedItem>>,
    /// Destination of payloads
    pub sink: Box<dyn SampleSink>,
    /// Per-item diagnostics
    pub timing: Arc<TimingLog>,
    /// Shared counters
    pub counters: Arc<PipelineCounters>,
    /// Set when the drain timed out; remaining items are discarded
    pub cancel: Arc<AtomicBool>,
    /// Consecutive failures before escalating
    pub failure_threshold: u32,
    /// Escalation callback
    pub on_fault: FaultHandler,
}

fn millis(d: std::time::Duration) -> f64 {
    d.as_secs_f64() * 1e3
}

fn signed_millis(later: DateTime<Utc>, earlier: DateTime<Utc>) -> f64 {
    (later - earlier)
        .num_microseconds()
        .map_or(0.0, |us| us as f64 / 1e3)
}

impl WriterTask {
    /// Start the thread. The receiver resolves once the queue is drained and
    /// the sink finished.
    pub fn spawn(self) -> AppResult<oneshot::Receiver<AppResult<()>>> {
        let (done_tx, done_rx) = oneshot::channel();
        std::thread::Builder::new()
            .name("recording-writer".into())
            .spawn(move || {
                let result = self.run();
                let _ = done_tx.send(result);
            })?;
        Ok(done_rx)
    }

    fn run(mut self) -> AppResult<()> {
        debug!("Writer thread started");
        let mut consecutive_failures: u32 = 0;
        let mut faulted = false;

        while let Some(item) = self.queue.pop() {
            if self.cancel.load(Ordering::Acquire) {
                self.counters.residual.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let write_wall = Utc::now();
            let write_start = Instant::now();
            let queue_delay = write_start.saturating_duration_since(item.enqueued_at.into_std());

            if let Err(e) = self.sink.write(&item) {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                consecutive_failures += 1;
                warn!(index = item.index, error = %e, consecutive_failures, "Write failed");
                if consecutive_failures >= self.failure_threshold && !faulted {
                    faulted = true;
                    error!(consecutive_failures, "Writes keep failing, escalating");
                    (self.on_fault)(format!(
                        "{} consecutive write failures, last: {}",
                        consecutive_failures, e
                    ));
                }
                continue;
            }
            consecutive_failures = 0;
            let write_duration = write_start.elapsed();

            self.counters.written.fetch_add(1, Ordering::Relaxed);
            if item.is_duplicate {
                self.counters.written_duplicates.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.written_fresh.fetch_add(1, Ordering::Relaxed);
            }

            let expected = millis(item.expected_interval);
            let actual = item.actual_interval.map(millis);
            let row = TimingRow {
                frame_index: item.index,
                sequence: item.sequence,
                capture_time: item.captured_at.to_rfc3339(),
                write_time: write_wall.to_rfc3339(),
                expected_interval_ms: expected,
                actual_interval_ms: actual,
                interval_error_ms: actual.map(|a| a - expected),
                queue_delay_ms: millis(queue_delay),
                write_duration_ms: millis(write_duration),
                queue_depth_after_write: self.queue.len(),
                is_duplicate: item.is_duplicate,
                tick_lag_ms: signed_millis(write_wall, item.captured_at),
            };
            if let Err(e) = self.timing.record(&row) {
                warn!(index = item.index, error = %e, "Timing row not recorded");
            }
        }

        let result = self.sink.finish();
        if let Err(e) = &result {
            warn!(error = %e, "Sink did not finish cleanly");
        }
        if let Err(e) = self.timing.flush() {
            warn!(error = %e, "Timing log flush failed");
        }
        debug!("Writer thread finished");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn item(index: u64) -> QueuedItem {
        QueuedItem {
            index,
            sequence: index,
            captured_at: Utc::now(),
            payload: Bytes::from_static(b"abcd"),
            is_duplicate: false,
            enqueued_at: tokio::time::Instant::now(),
            expected_interval: Duration::from_millis(33),
            actual_interval: None,
        }
    }

    struct FailingSink;

    impl SampleSink for FailingSink {
        fn write(&mut self, _item: &QueuedItem) -> AppResult<()> {
            Err(RecorderError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        fn finish(&mut self) -> AppResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_writes_payloads_and_timing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("trial_001.raw");
        let timing = Arc::new(TimingLog::create(dir.path().join("timing.csv")).unwrap());
        let queue = Arc::new(WorkQueue::new("writer-test", 16));
        let counters = Arc::new(PipelineCounters::default());

        for i in 0..5 {
            queue.push(item(i));
        }
        queue.close();

        let done = WriterTask {
            queue,
            sink: Box::new(RawFileSink::create(&output).unwrap()),
            timing: timing.clone(),
            counters: counters.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
            failure_threshold: 3,
            on_fault: Box::new(|_| {}),
        }
        .spawn()
        .unwrap();
        done.await.unwrap().unwrap();

        assert_eq!(std::fs::read(&output).unwrap().len(), 20);
        assert_eq!(timing.rows(), 5);
        assert_eq!(counters.written.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_persistent_failures_escalate_once() {
        let dir = tempfile::tempdir().unwrap();
        let timing = Arc::new(TimingLog::create(dir.path().join("timing.csv")).unwrap());
        let queue = Arc::new(WorkQueue::new("failing", 16));
        let counters = Arc::new(PipelineCounters::default());
        let faults = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            queue.push(item(i));
        }
        queue.close();

        let seen = faults.clone();
        let done = WriterTask {
            queue,
            sink: Box::new(FailingSink),
            timing: timing.clone(),
            counters: counters.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
            failure_threshold: 3,
            on_fault: Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        }
        .spawn()
        .unwrap();
        done.await.unwrap().unwrap();

        assert_eq!(faults.load(Ordering::SeqCst), 1);
        assert_eq!(counters.write_errors.load(Ordering::Relaxed), 10);
        assert_eq!(timing.rows(), 0);
    }
}

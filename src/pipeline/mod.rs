//! Recording pipeline: Mailbox → Pacer → WorkQueue → Writer.
//!
//! ```text
//! capture thread --put--> Mailbox --take--> Pacer (tokio task, 1/R deadlines)
//!                                              |
//!                                              v push (drop-oldest)
//!                                          WorkQueue --pop--> Writer (OS thread) --> sink + timing CSV
//! capture thread --push--> EventLog (drop-oldest) --periodic flush--> events CSV
//! ```
//!
//! Overflow policy per stream type: fixed-cadence media duplicates the last
//! sample when nothing new arrived, event streams never duplicate and drop
//! their oldest record when full. The work queue itself always drops oldest.

pub mod event_log;
pub mod mailbox;
pub mod pacer;
pub mod timing_log;
pub mod work_queue;
pub mod writer;

pub use event_log::{EventLog, EventLogStats};
pub use mailbox::Mailbox;
pub use pacer::{Pacer, Tick};
pub use timing_log::{TimingLog, TimingRow};
pub use work_queue::{PushOutcome, WorkQueue};
pub use writer::{FaultHandler, RawFileSink, SampleSink, WriterTask};

use crate::config::PipelineConfig;
use crate::core::Sample;
use crate::error::{AppResult, RecorderError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Item travelling from the pacer to the writer.
#[derive(Clone, Debug)]
pub struct QueuedItem {
    /// Position in the output stream
    pub index: u64,
    /// Device sequence number of the payload
    pub sequence: u64,
    /// Capture timestamp of the payload
    pub captured_at: DateTime<Utc>,
    /// Encoded payload
    pub payload: Bytes,
    /// Payload reused from the previous tick
    pub is_duplicate: bool,
    /// Monotonic enqueue time
    pub enqueued_at: tokio::time::Instant,
    /// Nominal tick interval
    pub expected_interval: Duration,
    /// Measured interval since the previous tick
    pub actual_interval: Option<Duration>,
}

/// Counters shared by the pacer and the writer thread.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    /// Items the pacer produced
    pub emitted: AtomicU64,
    /// Deadlines before the first sample arrived
    pub empty_ticks: AtomicU64,
    /// Items written to the sink
    pub written: AtomicU64,
    /// Written items carrying a fresh capture
    pub written_fresh: AtomicU64,
    /// Written items carrying a duplicate
    pub written_duplicates: AtomicU64,
    /// Failed sink writes
    pub write_errors: AtomicU64,
    /// Items discarded after a drain timeout
    pub residual: AtomicU64,
}

/// Final counters of one recording.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingReport {
    /// Media output file, when a paced stream was recorded
    pub output: Option<PathBuf>,
    /// Timing log
    pub timing: Option<PathBuf>,
    /// Event log
    pub events: Option<PathBuf>,
    /// Items the pacer handed to the work queue
    pub emitted: u64,
    /// Items written (`captured + duplicated`)
    pub written: u64,
    /// Written items with a fresh capture
    pub captured: u64,
    /// Written items reusing the previous capture
    pub duplicated: u64,
    /// Items evicted from the work queue
    pub dropped: u64,
    /// Items force-cancelled after the drain timeout
    pub residual: u64,
    /// Deepest the work queue got
    pub queue_high_water: usize,
    /// Failed sink writes
    pub write_errors: u64,
    /// Deadlines before the first sample arrived
    pub empty_ticks: u64,
    /// Rows in the timing log
    pub timing_rows: u64,
    /// Event records written
    pub events_written: u64,
    /// Event records evicted
    pub events_dropped: u64,
    /// Wall-clock recording duration
    pub duration_secs: f64,
}

/// Tunables of one pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineOptions {
    /// Pacing rate
    pub rate_hz: f64,
    /// Work queue capacity `C`
    pub queue_capacity: usize,
    /// Consecutive write failures before escalating
    pub write_failure_threshold: u32,
    /// Event buffer capacity
    pub event_queue_capacity: usize,
    /// Event log flush period
    pub event_flush_interval: Duration,
}

impl PipelineOptions {
    /// Options from configuration at the given pacing rate.
    pub fn from_config(config: &PipelineConfig, rate_hz: f64) -> Self {
        Self {
            rate_hz,
            queue_capacity: config.queue_capacity,
            write_failure_threshold: config.write_failure_threshold,
            event_queue_capacity: config.event_queue_capacity,
            event_flush_interval: config.event_flush_interval,
        }
    }
}

/// Output files opened ahead of the pipeline start.
pub struct PreparedRecording {
    output: Option<PathBuf>,
    sink: Option<Box<dyn SampleSink>>,
    events: Option<Arc<EventLog>>,
    options: PipelineOptions,
}

impl std::fmt::Debug for PreparedRecording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedRecording")
            .field("output", &self.output)
            .field("events", &self.events.as_ref().map(|e| e.path().to_path_buf()))
            .field("options", &self.options)
            .finish()
    }
}

impl PreparedRecording {
    /// Open the media sink (when `paced`) and the event log (when requested).
    pub fn open(
        output: PathBuf,
        events: Option<PathBuf>,
        paced: bool,
        options: PipelineOptions,
    ) -> AppResult<Self> {
        let sink: Option<Box<dyn SampleSink>> = if paced {
            Some(Box::new(RawFileSink::create(&output)?))
        } else {
            None
        };
        Self::with_sink(output, sink, events, options)
    }

    /// Like [`open`](Self::open) with a caller supplied sink.
    pub fn with_sink(
        output: PathBuf,
        sink: Option<Box<dyn SampleSink>>,
        events: Option<PathBuf>,
        options: PipelineOptions,
    ) -> AppResult<Self> {
        if sink.is_some() && (!options.rate_hz.is_finite() || options.rate_hz <= 0.0) {
            return Err(RecorderError::Pipeline(format!(
                "invalid recording rate {}",
                options.rate_hz
            )));
        }
        let events = match events {
            Some(path) => Some(Arc::new(EventLog::create(path, options.event_queue_capacity)?)),
            None => None,
        };

        Ok(Self {
            output: sink.is_some().then_some(output),
            sink,
            events,
            options,
        })
    }
}

struct PacedStage {
    queue: Arc<WorkQueue<QueuedItem>>,
    pacer_stop: oneshot::Sender<()>,
    pacer_task: JoinHandle<Pacer>,
    writer_done: oneshot::Receiver<AppResult<()>>,
}

struct EventStage {
    log: Arc<EventLog>,
    flusher_stop: oneshot::Sender<()>,
    flusher_task: JoinHandle<()>,
}

/// One running recording. Created on start, consumed by [`stop`](Self::stop).
pub struct RecordingPipeline {
    output: Option<PathBuf>,
    timing: Arc<TimingLog>,
    counters: Arc<PipelineCounters>,
    cancel: Arc<AtomicBool>,
    paced: Option<PacedStage>,
    events: Option<EventStage>,
    started: std::time::Instant,
}

/// A stopped pipeline: its report and the still-open timing log.
#[derive(Debug)]
pub struct StoppedRecording {
    /// Counters at stop time
    pub report: RecordingReport,
    /// Timing log, closed by the caller
    pub timing: Arc<TimingLog>,
}

impl RecordingPipeline {
    /// Start pacer, writer thread and event flusher.
    pub fn start(
        prepared: PreparedRecording,
        timing: Arc<TimingLog>,
        mailbox: Arc<Mailbox<Sample>>,
        on_fault: FaultHandler,
    ) -> AppResult<Self> {
        let PreparedRecording {
            output,
            sink,
            events,
            options,
        } = prepared;
        let counters = Arc::new(PipelineCounters::default());
        let cancel = Arc::new(AtomicBool::new(false));

        let paced = match sink {
            Some(sink) => {
                let queue = Arc::new(WorkQueue::new("recording", options.queue_capacity));
                let writer_done = WriterTask {
                    queue: queue.clone(),
                    sink,
                    timing: timing.clone(),
                    counters: counters.clone(),
                    cancel: cancel.clone(),
                    failure_threshold: options.write_failure_threshold.max(1),
                    on_fault,
                }
                .spawn()?;
                let pacer = Pacer::new(mailbox, queue.clone(), counters.clone(), options.rate_hz)?;
                let (pacer_stop, pacer_task) = pacer.spawn();
                Some(PacedStage {
                    queue,
                    pacer_stop,
                    pacer_task,
                    writer_done,
                })
            }
            None => None,
        };

        let events = events.map(|log| {
            let (flusher_stop, flusher_task) = log.spawn_flusher(options.event_flush_interval);
            EventStage {
                log,
                flusher_stop,
                flusher_task,
            }
        });

        info!(
            output = ?output,
            timing = %timing.path().display(),
            rate_hz = options.rate_hz,
            queue_capacity = options.queue_capacity,
            "Recording pipeline started"
        );

        Ok(Self {
            output,
            timing,
            counters,
            cancel,
            paced,
            events,
            started: std::time::Instant::now(),
        })
    }

    /// Event log the capture thread should feed, if any.
    pub fn event_log(&self) -> Option<Arc<EventLog>> {
        self.events.as_ref().map(|stage| stage.log.clone())
    }

    /// Live counters.
    pub fn counters(&self) -> &Arc<PipelineCounters> {
        &self.counters
    }

    /// Items evicted from the work queue so far.
    pub fn dropped(&self) -> u64 {
        self.paced
            .as_ref()
            .map_or(0, |stage| stage.queue.overflow_count())
    }

    /// Stop the pacer, then give the writer `drain_timeout` to empty the queue.
    /// Items still queued after that are cancelled and counted as residual.
    pub async fn stop(self, drain_timeout: Duration) -> StoppedRecording {
        let Self {
            output,
            timing,
            counters,
            cancel,
            paced,
            events,
            started,
        } = self;

        let mut dropped = 0;
        let mut queue_high_water = 0;
        if let Some(stage) = paced {
            let _ = stage.pacer_stop.send(());
            if let Err(e) = stage.pacer_task.await {
                warn!(error = %e, "Pacer task failed");
            }
            stage.queue.close();

            match tokio::time::timeout(drain_timeout, stage.writer_done).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(error = %e, "Writer finished with an error"),
                Ok(Err(_)) => warn!("Writer thread ended without reporting"),
                Err(_) => {
                    cancel.store(true, Ordering::Release);
                    let residual = stage.queue.drain().len() as u64;
                    counters.residual.fetch_add(residual, Ordering::Relaxed);
                    let err = RecorderError::DrainTimeout {
                        residual: counters.residual.load(Ordering::Relaxed) as usize,
                    };
                    warn!(
                        timeout_ms = drain_timeout.as_millis() as u64,
                        residual = counters.residual.load(Ordering::Relaxed),
                        "{}",
                        err
                    );
                }
            }
            dropped = stage.queue.overflow_count();
            queue_high_water = stage.queue.high_water();
        }

        let mut events_path = None;
        let mut event_stats = EventLogStats::default();
        if let Some(stage) = events {
            let _ = stage.flusher_stop.send(());
            if let Err(e) = stage.flusher_task.await {
                warn!(error = %e, "Event flusher task failed");
            }
            let log = stage.log.clone();
            events_path = Some(log.path().to_path_buf());
            match tokio::task::spawn_blocking(move || log.close()).await {
                Ok(Ok(stats)) => event_stats = stats,
                Ok(Err(e)) => {
                    warn!(error = %e, "Event log close failed");
                    event_stats = stage.log.stats();
                }
                Err(e) => warn!(error = %e, "Event log close task failed"),
            }
        }

        let report = RecordingReport {
            output,
            timing: Some(timing.path().to_path_buf()),
            events: events_path,
            emitted: counters.emitted.load(Ordering::Relaxed),
            written: counters.written.load(Ordering::Relaxed),
            captured: counters.written_fresh.load(Ordering::Relaxed),
            duplicated: counters.written_duplicates.load(Ordering::Relaxed),
            dropped,
            residual: counters.residual.load(Ordering::Relaxed),
            queue_high_water,
            write_errors: counters.write_errors.load(Ordering::Relaxed),
            empty_ticks: counters.empty_ticks.load(Ordering::Relaxed),
            timing_rows: timing.rows(),
            events_written: event_stats.written,
            events_dropped: event_stats.dropped,
            duration_secs: started.elapsed().as_secs_f64(),
        };

        info!(
            written = report.written,
            duplicated = report.duplicated,
            dropped = report.dropped,
            residual = report.residual,
            "Recording pipeline stopped"
        );

        StoppedRecording { report, timing }
    }
}

//! Fixed-rate pacer turning irregular captures into an exact-cadence stream.
//!
//! Deadlines sit at `start + k/R`. Every deadline produces exactly one item:
//! the sample waiting in the mailbox, or a duplicate of the previous one when
//! the mailbox is empty. A late wake-up emits every deadline it overslept, so
//! scheduling jitter never changes the item count. Stopping emits the
//! deadlines up to the stop instant, then ends.

use crate::core::Sample;
use crate::error::{AppResult, RecorderError};
use crate::pipeline::mailbox::Mailbox;
use crate::pipeline::work_queue::{PushOutcome, WorkQueue};
use crate::pipeline::{PipelineCounters, QueuedItem};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Result of one deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    /// An item was queued
    Emitted {
        /// Position of the item in the output stream
        index: u64,
        /// Reused the previous sample
        is_duplicate: bool,
        /// Queuing it evicted the oldest queued item
        evicted: bool,
    },
    /// No sample has arrived yet; nothing to emit
    Empty,
}

/// Pacer state. Drive it with [`tick`](Pacer::tick) or [`spawn`](Pacer::spawn).
#[derive(Debug)]
pub struct Pacer {
    mailbox: Arc<Mailbox<Sample>>,
    queue: Arc<WorkQueue<QueuedItem>>,
    counters: Arc<PipelineCounters>,
    interval: Duration,
    last_sample: Option<Sample>,
    last_tick: Option<Instant>,
    next_index: u64,
}

impl Pacer {
    /// Pacer at `rate_hz` items per second.
    pub fn new(
        mailbox: Arc<Mailbox<Sample>>,
        queue: Arc<WorkQueue<QueuedItem>>,
        counters: Arc<PipelineCounters>,
        rate_hz: f64,
    ) -> AppResult<Self> {
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(RecorderError::Pipeline(format!(
                "pacing rate must be positive, got {}",
                rate_hz
            )));
        }

        Ok(Self {
            mailbox,
            queue,
            counters,
            interval: Duration::from_secs_f64(1.0 / rate_hz),
            last_sample: None,
            last_tick: None,
            next_index: 0,
        })
    }

    /// Nominal tick interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Handle one deadline at `now`.
    pub fn tick(&mut self, now: Instant) -> Tick {
        let actual_interval = self.last_tick.map(|last| now.saturating_duration_since(last));
        self.last_tick = Some(now);

        let (sample, is_duplicate) = match self.mailbox.take() {
            Some(sample) => {
                self.last_sample = Some(sample.clone());
                (sample, false)
            }
            None => match &self.last_sample {
                Some(previous) => (previous.clone(), true),
                None => {
                    self.counters.empty_ticks.fetch_add(1, Ordering::Relaxed);
                    return Tick::Empty;
                }
            },
        };

        let index = self.next_index;
        self.next_index += 1;
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);

        let item = QueuedItem {
            index,
            sequence: sample.sequence,
            captured_at: sample.captured_at,
            payload: sample.payload,
            is_duplicate,
            enqueued_at: now,
            expected_interval: self.interval,
            actual_interval,
        };

        let evicted = match self.queue.push(item) {
            PushOutcome::Queued => false,
            PushOutcome::Evicted(_) => true,
            PushOutcome::Closed(_) => {
                trace!(index, "Queue closed, item discarded");
                false
            }
        };

        Tick::Emitted {
            index,
            is_duplicate,
            evicted,
        }
    }

    fn deadline(&self, start: Instant, k: u64) -> Instant {
        start + self.interval.mul_f64(k as f64)
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) -> Self {
        let start = Instant::now();
        let mut due: u64 = 0;
        debug!(interval_ms = self.interval.as_secs_f64() * 1e3, "Pacer started");

        loop {
            let next = self.deadline(start, due);
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {
                    let now = Instant::now();
                    while self.deadline(start, due) <= now {
                        self.tick(now);
                        due += 1;
                    }
                }
                _ = &mut stop => {
                    let now = Instant::now();
                    while self.deadline(start, due) <= now {
                        self.tick(now);
                        due += 1;
                    }
                    break;
                }
            }
        }

        debug!(ticks = due, "Pacer stopped");
        self
    }

    /// Run on the async runtime until `stop` fires; the task yields the pacer back.
    pub fn spawn(self) -> (oneshot::Sender<()>, JoinHandle<Self>) {
        let (stop_tx, stop_rx) = oneshot::channel();
        (stop_tx, tokio::spawn(self.run(stop_rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;

    fn sample(sequence: u64) -> Sample {
        Sample {
            sequence,
            captured_at: Utc::now(),
            payload: Bytes::from(vec![sequence as u8; 4]),
        }
    }

    fn pacer(capacity: usize) -> (Pacer, Arc<Mailbox<Sample>>, Arc<WorkQueue<QueuedItem>>) {
        let mailbox = Arc::new(Mailbox::new());
        let queue = Arc::new(WorkQueue::new("pacer-test", capacity));
        let pacer = Pacer::new(
            mailbox.clone(),
            queue.clone(),
            Arc::new(PipelineCounters::default()),
            30.0,
        )
        .unwrap();
        (pacer, mailbox, queue)
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        let result = Pacer::new(
            Arc::new(Mailbox::new()),
            Arc::new(WorkQueue::new("q", 1)),
            Arc::new(PipelineCounters::default()),
            0.0,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_empty_mailbox_duplicates_last_sample() {
        let (mut pacer, mailbox, queue) = pacer(16);
        let now = Instant::now();

        assert_eq!(pacer.tick(now), Tick::Empty);
        mailbox.put(sample(1));
        assert_eq!(
            pacer.tick(now),
            Tick::Emitted {
                index: 0,
                is_duplicate: false,
                evicted: false
            }
        );
        assert_eq!(
            pacer.tick(now),
            Tick::Emitted {
                index: 1,
                is_duplicate: true,
                evicted: false
            }
        );

        let first = queue.try_pop().unwrap();
        let second = queue.try_pop().unwrap();
        assert_eq!(first.payload, second.payload);
        assert_eq!(second.sequence, 1);
        assert!(second.is_duplicate);
        assert_eq!(pacer.counters.empty_ticks.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_full_queue_never_blocks_pacer() {
        let (mut pacer, mailbox, queue) = pacer(4);
        let now = Instant::now();
        for i in 0..20 {
            mailbox.put(sample(i));
            pacer.tick(now);
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.overflow_count(), 16);
        assert_eq!(queue.try_pop().unwrap().index, 16);
    }

    #[tokio::test]
    async fn test_spawned_pacer_keeps_cadence() {
        let (pacer, mailbox, queue) = pacer(1024);
        mailbox.put(sample(0));
        let started = std::time::Instant::now();
        let (stop, task) = pacer.spawn();
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = stop.send(());
        let pacer = task.await.unwrap();
        let elapsed = started.elapsed().as_secs_f64();

        let emitted = pacer.counters.emitted.load(Ordering::Relaxed) as f64;
        let expected = (elapsed * 30.0).round();
        assert!(
            (emitted - expected).abs() <= 1.0,
            "emitted {} items, expected {} ± 1",
            emitted,
            expected
        );
        assert_eq!(queue.len() as f64, emitted);
    }
}

//! Bounded FIFO between the pacer and the writer thread.
//!
//! A full queue evicts its oldest item to admit the new one, so the producer
//! never blocks. Evictions are counted and logged on a thinning schedule.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// What happened to a pushed item.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    /// Queued without loss
    Queued,
    /// Queued; the returned oldest item was evicted to make room
    Evicted(T),
    /// Queue closed; the item was not queued
    Closed(T),
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    high_water: usize,
}

/// Drop-oldest bounded queue with a blocking consumer side.
#[derive(Debug)]
pub struct WorkQueue<T> {
    name: String,
    capacity: usize,
    inner: Mutex<Inner<T>>,
    available: Condvar,
    overflow: AtomicU64,
}

/// Overflow events 1-10 are logged each, then every 10th until 100, then every 100th.
pub fn should_log_overflow(count: u64) -> bool {
    match count {
        0 => false,
        1..=10 => true,
        11..=100 => count % 10 == 0,
        _ => count % 100 == 0,
    }
}

impl<T> WorkQueue<T> {
    /// Create a queue holding at most `capacity` items (at least one).
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                high_water: 0,
            }),
            available: Condvar::new(),
            overflow: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item, evicting the oldest one when full. Never blocks on the consumer.
    pub fn push(&self, item: T) -> PushOutcome<T> {
        let mut inner = self.lock();
        if inner.closed {
            return PushOutcome::Closed(item);
        }

        let evicted = if inner.items.len() >= self.capacity {
            inner.items.pop_front()
        } else {
            None
        };
        inner.items.push_back(item);
        inner.high_water = inner.high_water.max(inner.items.len());
        drop(inner);
        self.available.notify_one();

        match evicted {
            Some(old) => {
                let count = self.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                if should_log_overflow(count) {
                    warn!(
                        queue = %self.name,
                        overflow = count,
                        capacity = self.capacity,
                        "Work queue full, evicted oldest item"
                    );
                }
                PushOutcome::Evicted(old)
            }
            None => PushOutcome::Queued,
        }
    }

    /// Block until an item is available. `None` once closed and empty.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Refuse further pushes and wake the consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    /// Remove and return everything still queued.
    pub fn drain(&self) -> Vec<T> {
        self.lock().items.drain(..).collect()
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest depth ever observed.
    pub fn high_water(&self) -> usize {
        self.lock().high_water
    }

    /// Items evicted so far. Monotonic.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    fn test_overflow_evicts_oldest() {
        let queue = WorkQueue::new("test", 3);
        for i in 0..3 {
            assert_eq!(queue.push(i), PushOutcome::Queued);
        }
        assert_eq!(queue.push(3), PushOutcome::Evicted(0));
        assert_eq!(queue.push(4), PushOutcome::Evicted(1));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.overflow_count(), 2);
        assert_eq!(queue.drain(), vec![2, 3, 4]);
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let queue = WorkQueue::new("bound", 8);
        for i in 0..100 {
            queue.push(i);
            assert!(queue.len() <= 8);
        }
        assert_eq!(queue.high_water(), 8);
        assert_eq!(queue.overflow_count(), 92);
    }

    #[test]
    fn test_closed_queue_rejects_and_drains() {
        let queue = WorkQueue::new("closed", 4);
        queue.push(1);
        queue.close();
        assert_eq!(queue.push(2), PushOutcome::Closed(2));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let queue = Arc::new(WorkQueue::<u32>::new("wake", 4));
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.pop())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_overflow_sampling_schedule() {
        let logged: Vec<u64> = (1..=1000).filter(|n| should_log_overflow(*n)).collect();
        assert_eq!(&logged[..10], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert!(logged.contains(&20));
        assert!(!logged.contains(&25));
        assert!(logged.contains(&100));
        assert!(!logged.contains(&150));
        assert!(logged.contains(&1000));
        assert_eq!(logged.len(), 10 + 9 + 9);
    }

    #[test]
    #[traced_test]
    fn test_overflow_logging_is_sampled() {
        let queue = WorkQueue::new("sampled", 1);
        queue.push(0u32);
        for i in 1..=250 {
            queue.push(i);
        }
        assert_eq!(queue.overflow_count(), 250);
        logs_assert(|lines: &[&str]| {
            let warnings = lines
                .iter()
                .filter(|line| line.contains("Work queue full"))
                .count();
            // 1..=10, 20..=100 step 10, 200
            if warnings == 20 {
                Ok(())
            } else {
                Err(format!("expected 20 overflow warnings, got {}", warnings))
            }
        });
    }
}

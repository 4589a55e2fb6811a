// SPDX-License-Identifier: MIT OR Apache-2.0
//! Priority and pool queue primitives for the procurement sync worker.
//!
//! [`PriorityQueue`] backs the ready and retry queues: lower numeric priority
//! is dequeued first, and items of equal priority are served FIFO.
//! [`PoolQueue`] backs the API client pool: plain FIFO, with an optional
//! delayed return used after a rate-limited fetch.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Errors returned by queue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has reached its configured capacity.
    Full {
        /// Configured maximum capacity.
        max: usize,
    },
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Full { max } => write!(f, "queue is full (max {max})"),
        }
    }
}

impl std::error::Error for QueueError {}

struct Entry<T> {
    priority: i64,
    seq: u64,
    value: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ascending priority, then insertion order (seq) — compared normally so
        // that wrapping in `Reverse` turns the max-heap into a min-heap keyed
        // on (priority, seq).
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

struct PriorityInner<T> {
    heap: BinaryHeap<std::cmp::Reverse<Entry<T>>>,
    next_seq: u64,
    capacity: usize,
}

struct PrioritySharedState<T> {
    state: Mutex<PriorityInner<T>>,
    notify: Notify,
}

/// A bounded, priority-ordered FIFO queue of `(priority, item)` pairs.
///
/// Lowest numeric priority is dequeued first; ties are broken by insertion
/// order. Cheaply cloneable — clones share the same underlying queue.
pub struct PriorityQueue<T> {
    inner: Arc<PrioritySharedState<T>>,
}

impl<T> Clone for PriorityQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PriorityQueue<T> {
    /// Create a new queue. `capacity == 0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PrioritySharedState {
                state: Mutex::new(PriorityInner {
                    heap: BinaryHeap::new(),
                    next_seq: 0,
                    capacity,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Push `(priority, value)` onto the queue.
    pub async fn push(&self, priority: i64, value: T) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.capacity != 0 && state.heap.len() >= state.capacity {
                return Err(QueueError::Full {
                    max: state.capacity,
                });
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(std::cmp::Reverse(Entry {
                priority,
                seq,
                value,
            }));
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Remove and return the lowest-priority `(priority, value)` pair,
    /// waiting up to `timeout` for an item to arrive.
    ///
    /// Returns `None` on timeout; an empty queue is a normal outcome, not
    /// an error.
    pub async fn try_pop(&self, timeout: Duration) -> Option<(i64, T)> {
        let deadline = Instant::now() + timeout;
        loop {
            // Subscribe before checking so a concurrent push's `notify_waiters`
            // cannot be missed between the check and the wait.
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().await;
                if let Some(std::cmp::Reverse(entry)) = state.heap.pop() {
                    return Some((entry.priority, entry.value));
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Number of items currently queued.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.heap.len()
    }

    /// `true` if the queue currently holds no items.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

struct PoolInner<T> {
    items: VecDeque<T>,
    capacity: usize,
}

struct PoolSharedState<T> {
    state: Mutex<PoolInner<T>>,
    notify: Notify,
}

/// A bounded FIFO pool of leasable items (API client handles).
///
/// Cheaply cloneable — clones share the same underlying pool, which is how
/// a delayed [`PoolQueue::release_after`] can run on a detached task.
pub struct PoolQueue<T> {
    inner: Arc<PoolSharedState<T>>,
}

impl<T> Clone for PoolQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> PoolQueue<T> {
    /// Create a new pool bounded at `capacity` items (`0` = unbounded).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolSharedState {
                state: Mutex::new(PoolInner {
                    items: VecDeque::new(),
                    capacity,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Put an item into the pool immediately.
    pub async fn push(&self, value: T) -> Result<(), QueueError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.capacity != 0 && state.items.len() >= state.capacity {
                return Err(QueueError::Full {
                    max: state.capacity,
                });
            }
            state.items.push_back(value);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Put an item into the pool after `delay` has elapsed, on a detached
    /// task. Used after a rate-limited release so a throttled client cannot
    /// be immediately re-leased by another worker.
    pub fn release_after(&self, value: T, delay: Duration) {
        if delay.is_zero() {
            let pool = self.clone();
            tokio::spawn(async move {
                let _ = pool.push(value).await;
            });
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = pool.push(value).await;
        });
    }

    /// Remove and return one item, waiting up to `timeout`.
    ///
    /// Returns `None` if the pool is empty for the whole wait — an immediate
    /// empty observation and a timed-out pop are both folded into this
    /// single call.
    pub async fn try_pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().await;
                if let Some(value) = state.items.pop_front() {
                    return Some(value);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Number of items currently parked in the pool.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.items.len()
    }

    /// `true` if the pool currently holds no items.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pops_lowest_priority_first() {
        let q = PriorityQueue::new(0);
        q.push(5, "low-priority-number-last").await.unwrap();
        q.push(1, "first").await.unwrap();
        q.push(3, "middle").await.unwrap();

        let (p, v) = q.try_pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(p, 1);
        assert_eq!(v, "first");
    }

    #[tokio::test]
    async fn ties_are_fifo() {
        let q = PriorityQueue::new(0);
        q.push(1, "a").await.unwrap();
        q.push(1, "b").await.unwrap();
        q.push(1, "c").await.unwrap();

        assert_eq!(q.try_pop(Duration::from_millis(10)).await.unwrap().1, "a");
        assert_eq!(q.try_pop(Duration::from_millis(10)).await.unwrap().1, "b");
        assert_eq!(q.try_pop(Duration::from_millis(10)).await.unwrap().1, "c");
    }

    #[tokio::test]
    async fn pop_times_out_on_empty() {
        let q: PriorityQueue<i32> = PriorityQueue::new(0);
        let start = Instant::now();
        let result = q.try_pop(Duration::from_millis(20)).await;
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn push_wakes_a_waiting_pop() {
        let q = PriorityQueue::new(0);
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.try_pop(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push(10, "woken").await.unwrap();

        let result = handle.await.unwrap();
        assert_eq!(result, Some((10, "woken")));
    }

    #[tokio::test]
    async fn bounded_queue_rejects_overflow() {
        let q = PriorityQueue::new(1);
        q.push(1, "only").await.unwrap();
        let err = q.push(2, "overflow").await.unwrap_err();
        assert_eq!(err, QueueError::Full { max: 1 });
    }

    #[tokio::test]
    async fn pool_is_fifo() {
        let pool: PoolQueue<&'static str> = PoolQueue::new(0);
        pool.push("first").await.unwrap();
        pool.push("second").await.unwrap();

        assert_eq!(pool.try_pop(Duration::from_millis(10)).await, Some("first"));
        assert_eq!(
            pool.try_pop(Duration::from_millis(10)).await,
            Some("second")
        );
    }

    #[tokio::test]
    async fn pool_pop_times_out_on_empty() {
        let pool: PoolQueue<i32> = PoolQueue::new(0);
        assert_eq!(pool.try_pop(Duration::from_millis(20)).await, None);
    }

    #[tokio::test]
    async fn release_after_delay_reappears_later() {
        let pool: PoolQueue<&'static str> = PoolQueue::new(0);
        pool.release_after("client-1", Duration::from_millis(30));

        assert_eq!(pool.try_pop(Duration::from_millis(5)).await, None);
        assert_eq!(
            pool.try_pop(Duration::from_millis(100)).await,
            Some("client-1")
        );
    }

    #[tokio::test]
    async fn release_after_zero_delay_is_immediate() {
        let pool: PoolQueue<&'static str> = PoolQueue::new(0);
        pool.release_after("client-1", Duration::ZERO);
        assert_eq!(
            pool.try_pop(Duration::from_millis(50)).await,
            Some("client-1")
        );
    }
}

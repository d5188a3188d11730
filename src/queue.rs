//! # Shared Queue with Sticky EOF
//!
//! The send/receive queue primitive used throughout the multi-channel
//! communicator (spec.md §4.2/§5), grounded on the original's `squeue`:
//! an unbounded FIFO with a "sticky" EOF flag. Once marked, every current
//! and future `push` fails, and every `pop` drains remaining items before
//! reporting closure — never silently, always via the return type.
//!
//! Where the original parks blocking `pop()` on a `std::condition_variable`
//! (one dedicated OS thread per role, per spec.md §5), this crate keeps the
//! same suspension semantics but expressed with `tokio::sync::Notify` so it
//! composes with the rest of the crate's `tokio`-task concurrency model
//! (see SPEC_FULL.md §4.3 note on the thread-to-task substitution).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Returned by [`SharedQueue::push`] and [`SharedQueue::pop`] once the
/// queue has been marked EOF and (for `pop`) drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

pub struct SharedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    eof: AtomicBool,
}

impl<T> SharedQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            eof: AtomicBool::new(false),
        }
    }

    /// Pushes an item. Fails if the queue has already been marked EOF.
    pub fn push(&self, item: T) -> Result<(), QueueClosed> {
        if self.eof.load(Ordering::Acquire) {
            return Err(QueueClosed);
        }
        self.inner.lock().push_back(item);
        self.notify.notify_one();
        Ok(())
    }

    /// Non-blocking pop: `None` if empty right now, regardless of EOF —
    /// callers distinguish "empty" from "closed" via [`SharedQueue::eof`]
    /// and [`SharedQueue::is_empty`] together, the way the poll loop
    /// distinguishes `try_receive` returning nothing from a closed channel.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Blocking pop (as a future): waits until an item is available, or
    /// returns `Err(QueueClosed)` once EOF is set and the queue is drained.
    pub async fn pop(&self) -> Result<T, QueueClosed> {
        loop {
            let notified = self.notify.notified();
            {
                let mut guard = self.inner.lock();
                if let Some(item) = guard.pop_front() {
                    return Ok(item);
                }
                if self.eof.load(Ordering::Acquire) {
                    return Err(QueueClosed);
                }
            }
            notified.await;
        }
    }

    /// Pop with a timeout; returns `None` on timeout (spec.md §5: available
    /// for latency-bounded polling, not currently exercised by the drivers
    /// in this crate but kept as part of the primitive's contract).
    pub async fn timed_pop(&self, timeout: Duration) -> Option<T> {
        match tokio::time::timeout(timeout, self.pop()).await {
            Ok(Ok(item)) => Some(item),
            Ok(Err(QueueClosed)) | Err(_) => None,
        }
    }

    pub fn mark_eof(&self) {
        self.eof.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// A channel is closed iff it has been marked EOF *and* drained
    /// (spec.md §3 invariant).
    pub fn is_closed(&self) -> bool {
        self.eof() && self.is_empty()
    }
}

impl<T> Default for SharedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn pop_returns_items_in_fifo_order() {
        let queue: SharedQueue<i32> = SharedQueue::new();
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.pop().await, Ok(1));
        assert_eq!(queue.pop().await, Ok(2));
    }

    #[tokio::test]
    async fn push_after_eof_fails() {
        let queue: SharedQueue<i32> = SharedQueue::new();
        queue.mark_eof();
        assert_eq!(queue.push(1), Err(QueueClosed));
    }

    #[tokio::test]
    async fn pop_drains_before_reporting_closed() {
        let queue: SharedQueue<i32> = SharedQueue::new();
        queue.push(1).unwrap();
        queue.mark_eof();
        assert_eq!(queue.pop().await, Ok(1));
        assert_eq!(queue.pop().await, Err(QueueClosed));
    }

    #[tokio::test]
    async fn blocking_pop_wakes_on_push_from_another_task() {
        let queue = Arc::new(SharedQueue::<i32>::new());
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                queue.push(42).unwrap();
            })
        };
        let popped = queue.pop().await.unwrap();
        assert_eq!(popped, 42);
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn timed_pop_returns_none_on_timeout() {
        let queue: SharedQueue<i32> = SharedQueue::new();
        let result = queue.timed_pop(Duration::from_millis(10)).await;
        assert_eq!(result, None);
    }
}

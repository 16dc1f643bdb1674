//! Bounded outbound queue
//!
//! Sits between broker delivery callbacks and the connection writer. Pushes
//! never block: when the queue is full the oldest entry is evicted, so a slow
//! client only ever loses its own stale messages.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

use crate::metrics::OUTBOUND_DROPPED_TOTAL;

/// Result of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest entry
    DroppedOldest,
    /// The queue is closed; the item was discarded
    Closed,
}

/// Single-consumer, drop-oldest bounded queue
pub struct OutboundQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> OutboundQueue<T> {
    /// Create a queue holding at most `capacity` items (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, item: T) -> PushOutcome {
        let mut state = self.state.lock();
        if state.closed {
            return PushOutcome::Closed;
        }

        let outcome = if state.items.len() >= self.capacity {
            state.items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(OUTBOUND_DROPPED_TOTAL).increment(1);
            PushOutcome::DroppedOldest
        } else {
            PushOutcome::Queued
        };
        state.items.push_back(item);
        drop(state);

        self.notify.notify_one();
        outcome
    }

    /// Wait for the next item; `None` once the queue is closed
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Take the next item without waiting
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.items.pop_front()
    }

    /// Close the queue, abandoning anything still queued
    pub fn close(&self) -> usize {
        let abandoned = {
            let mut state = self.state.lock();
            state.closed = true;
            let n = state.items.len();
            state.items.clear();
            n
        };
        self.notify.notify_waiters();
        self.notify.notify_one();
        abandoned
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

//! Delivery counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals for one bus. Relaxed atomics; values are advisory.
#[derive(Debug, Default)]
pub struct BusStats {
    /// `publish` calls that passed the outbound pipeline.
    pub published: AtomicU64,
    /// Frames handed to the connection, less those returned unwritten.
    pub sent: AtomicU64,
    /// Frames a lost link returned unwritten and the queue took back.
    pub requeued: AtomicU64,
    /// Envelopes buffered while disconnected.
    pub queued: AtomicU64,
    /// Queued envelopes evicted by `drop_oldest`, or discarded on failure/close.
    pub evicted: AtomicU64,
    /// Publishes refused with `QueueFull`.
    pub rejected: AtomicU64,
    /// Successful handler invocations.
    pub delivered: AtomicU64,
    /// Inbound frames the codec could not decode.
    pub decode_errors: AtomicU64,
    /// Messages halted or rejected by middleware, either direction.
    pub middleware_rejections: AtomicU64,
    /// Handler errors and panics.
    pub handler_errors: AtomicU64,
}

/// Point-in-time copy of `BusStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub published: u64,
    pub sent: u64,
    pub requeued: u64,
    pub queued: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub decode_errors: u64,
    pub middleware_rejections: u64,
    pub handler_errors: u64,
}

impl BusStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn sub(counter: &AtomicU64, n: u64) {
        counter.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            middleware_rejections: self.middleware_rejections.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

//! Bounded outbound queue with a configurable backpressure policy.
//!
//! Holds publishes made while the connection is down. Entries leave in
//! FIFO order when the bus flushes on (re)connect.

use std::collections::VecDeque;

use crate::config::BackpressurePolicy;

/// The queue refused an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Outbound queue full (capacity {capacity})")]
pub struct QueueFull {
    pub capacity: usize,
}

/// How an entry was accepted.
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued<T> {
    Queued,
    /// Accepted after evicting the oldest entry, returned here.
    QueuedWithEviction(T),
}

/// FIFO buffer bounded at `capacity` entries.
#[derive(Debug)]
pub struct OutboundQueue<T> {
    entries: VecDeque<T>,
    capacity: usize,
    policy: BackpressurePolicy,
}

impl<T> OutboundQueue<T> {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            policy,
        }
    }

    /// Append an entry, applying the backpressure policy when full.
    ///
    /// With capacity 0 nothing can be buffered, so every push is refused
    /// under either policy.
    pub fn push(&mut self, entry: T) -> Result<Enqueued<T>, QueueFull> {
        if self.entries.len() < self.capacity {
            self.entries.push_back(entry);
            return Ok(Enqueued::Queued);
        }

        match self.policy {
            BackpressurePolicy::DropOldest if self.capacity > 0 => {
                let evicted = self.entries.pop_front();
                self.entries.push_back(entry);
                Ok(evicted.map_or(Enqueued::Queued, Enqueued::QueuedWithEviction))
            }
            _ => Err(QueueFull {
                capacity: self.capacity,
            }),
        }
    }

    /// Take every entry, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).collect()
    }

    /// Put entries back at the head, ahead of anything queued since.
    ///
    /// Used when a flush is interrupted. May temporarily exceed capacity;
    /// nothing already accepted is discarded.
    pub fn restore_front(&mut self, entries: Vec<T>) {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Discard everything, returning how many entries were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}

#[cfg(test)]
mod tests;

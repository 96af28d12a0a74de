//! Topic registry and dispatcher.
//!
//! Maps topic names to ordered subscriber lists and delivers each envelope
//! to every subscriber of its topic, in subscription order.
//!
//! # Re-entrancy
//!
//! Handlers may call `subscribe`, `unsubscribe` and `clear_topic` on the
//! registry they are dispatched from. `dispatch` snapshots the subscriber
//! list and releases the lock before calling any handler, so:
//! - a subscription removed before `dispatch` took its snapshot is never
//!   invoked;
//! - a subscription removed by an earlier handler during the same dispatch
//!   is skipped, because every subscription carries an `active` flag that
//!   is checked right before the call;
//! - removal racing with a dispatch running on another thread is NOT
//!   ordered: the handler may or may not see that one in-flight message;
//! - subscriptions added during a dispatch first see the next message.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, error};
use uuid::Uuid;

use super::envelope::Envelope;
use crate::utils::{panic_message, read, write};

/// Handle returned by `subscribe`, used to remove exactly one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A subscriber callback failed.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Payload did not match the expected type: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
    active: AtomicBool,
}

#[derive(Default)]
struct RegistryInner {
    topics: HashMap<String, Vec<Arc<Subscription>>>,
    /// Subscription id -> topic, for O(1) lookup on removal.
    index: HashMap<SubscriptionId, String>,
}

/// Delivery summary for one envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that returned `Ok`.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

/// Topic name -> ordered subscriptions.
#[derive(Default)]
pub struct TopicRegistry {
    inner: RwLock<RegistryInner>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`. Never fails.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_handler(topic, Arc::new(handler))
    }

    pub fn subscribe_handler(&self, topic: impl Into<String>, handler: Handler) -> SubscriptionId {
        let topic = topic.into();
        let id = SubscriptionId::new();
        let subscription = Arc::new(Subscription {
            id,
            handler,
            active: AtomicBool::new(true),
        });

        let mut inner = write(&self.inner);
        inner
            .topics
            .entry(topic.clone())
            .or_default()
            .push(subscription);
        debug!(topic = %topic, subscription = %id, "Subscribed");
        inner.index.insert(id, topic);
        id
    }

    /// Remove one subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = write(&self.inner);
        let Some(topic) = inner.index.remove(&id) else {
            return false;
        };

        if let Some(subscriptions) = inner.topics.get_mut(&topic) {
            if let Some(position) = subscriptions.iter().position(|s| s.id == id) {
                let removed = subscriptions.remove(position);
                removed.active.store(false, Ordering::Release);
            }
            if subscriptions.is_empty() {
                inner.topics.remove(&topic);
            }
        }
        debug!(topic = %topic, subscription = %id, "Unsubscribed");
        true
    }

    /// Remove every subscription for `topic`. Returns how many were removed.
    pub fn clear_topic(&self, topic: &str) -> usize {
        let mut inner = write(&self.inner);
        let Some(subscriptions) = inner.topics.remove(topic) else {
            return 0;
        };

        for subscription in &subscriptions {
            subscription.active.store(false, Ordering::Release);
            inner.index.remove(&subscription.id);
        }
        debug!(topic = %topic, removed = subscriptions.len(), "Topic cleared");
        subscriptions.len()
    }

    /// Remove everything.
    pub fn clear(&self) {
        let mut inner = write(&self.inner);
        for subscription in inner.topics.values().flatten() {
            subscription.active.store(false, Ordering::Release);
        }
        inner.topics.clear();
        inner.index.clear();
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        read(&self.inner).topics.get(topic).map_or(0, Vec::len)
    }

    /// Topics with at least one subscriber, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = read(&self.inner).topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Deliver `envelope` to every subscriber of its topic.
    ///
    /// Each handler is isolated: an error or panic is logged and counted,
    /// and the remaining handlers still run. No subscribers is a no-op.
    pub fn dispatch(&self, envelope: &Envelope) -> DispatchReport {
        let snapshot: Vec<Arc<Subscription>> = match read(&self.inner).topics.get(envelope.topic())
        {
            Some(subscriptions) => subscriptions.clone(),
            None => return DispatchReport::default(),
        };

        let mut report = DispatchReport::default();
        for subscription in snapshot {
            if !subscription.active.load(Ordering::Acquire) {
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| (subscription.handler)(envelope)));
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    error!(
                        topic = %envelope.topic(),
                        subscription = %subscription.id,
                        error = %e,
                        "Handler failed"
                    );
                    report.failed += 1;
                }
                Err(panic) => {
                    error!(
                        topic = %envelope.topic(),
                        subscription = %subscription.id,
                        panic = %panic_message(panic.as_ref()),
                        "Handler panicked"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }
}

//! Topic-multiplexed message bus over one reconnecting connection.
//!
//! This module contains:
//! - `MessageBus`: publish/subscribe façade owning exactly one `Connection`
//! - `Envelope` and the `Codec` trait (JSON codec provided)
//! - `MiddlewarePipeline`: validation/logging steps for inbound traffic,
//!   optionally outbound
//! - `TopicRegistry`: topic -> subscribers, with isolated dispatch
//! - `OutboundQueue`: buffering and backpressure while disconnected
//!
//! Inbound: frame -> codec -> middleware -> registry -> handlers, one frame
//! at a time on a single pump task. Outbound: `publish` runs the outbound
//! middleware, encodes, then either hands the frame to the live connection
//! or appends to the queue. It never waits on the network. A full write
//! buffer counts as not writable, and frames a lost link never wrote go
//! back to the head of the queue.
//!
//! Recoverable trouble (bad frames, validation failures, handler errors,
//! transient disconnects) is logged and absorbed. Queue overflow and
//! terminal failure are reported to callers; terminal failure is also
//! announced once on the configured error topic.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{BusConfig, ConfigError};
use crate::connection::{Connection, ConnectionError, ConnectionEvent, ConnectionState, Connector};
use crate::utils::lock;

pub mod codec;
pub mod envelope;
pub mod middleware;
pub mod queue;
pub mod registry;
pub mod stats;

pub use codec::{Codec, DecodeError, EncodeError, JsonCodec};
pub use envelope::{EmptyTopic, Envelope};
pub use middleware::{
    Direction, Flow, LoggingMiddleware, Middleware, MiddlewareError, MiddlewarePipeline, Next,
    PipelineOutcome, RequiredFields, TopicValidator, ValidationMiddleware,
};
pub use queue::{Enqueued, OutboundQueue, QueueFull};
pub use registry::{DispatchReport, Handler, HandlerError, SubscriptionId, TopicRegistry};
pub use stats::{BusStats, StatsSnapshot};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors from bus lifecycle and subscription calls.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Bus failed after {attempts} reconnect attempts: {reason}")]
    Failed { attempts: u32, reason: String },

    #[error("Bus closed")]
    Closed,

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors returned synchronously by `publish`.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    QueueFull(#[from] QueueFull),

    /// The bus was closed or has failed; it accepts nothing further.
    #[error("Bus closed")]
    BusClosed,

    #[error(transparent)]
    InvalidTopic(#[from] EmptyTopic),

    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// An outbound middleware rejected the message.
    #[error(transparent)]
    Rejected(#[from] MiddlewareError),
}

/// What happened to a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the live connection.
    Sent,
    /// Buffered until the connection is up.
    Queued,
    /// An outbound middleware halted it; nothing was sent.
    Filtered,
}

/// Delivery mode of the bus.
#[derive(Debug, Clone)]
enum Phase {
    /// Connection not writable; publishes go to the queue.
    Buffering,
    /// Queue flushed; publishes go straight to the connection.
    Live,
    /// Retries exhausted.
    Failed { attempts: u32, reason: String },
    /// `close()` was called.
    Closed,
}

struct BusState {
    phase: Phase,
    queue: OutboundQueue<Bytes>,
}

struct BusShared {
    config: BusConfig,
    codec: Box<dyn Codec>,
    registry: TopicRegistry,
    pipeline: MiddlewarePipeline,
    connection: Connection,
    state: Mutex<BusState>,
    stats: BusStats,
    stop: watch::Sender<bool>,
    /// Event receiver, handed to the pump task by `open()`.
    pending_events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

/// Publish/subscribe bus over one reconnecting connection.
///
/// Cheap to clone; clones share the same bus. Dropping the last clone
/// closes the connection.
#[derive(Clone)]
pub struct MessageBus {
    shared: Arc<BusShared>,
}

impl MessageBus {
    /// Create a bus using the JSON codec. Nothing connects until `open()`.
    pub fn new(config: BusConfig, connector: impl Connector) -> Self {
        Self::with_codec(config, connector, JsonCodec)
    }

    /// Create a bus with a custom wire codec.
    pub fn with_codec(config: BusConfig, connector: impl Connector, codec: impl Codec) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Connection::new(
            Arc::new(connector),
            config.reconnect_policy(),
            config.write_buffer,
            events_tx,
        );
        let queue = OutboundQueue::new(config.outbound_queue_capacity, config.backpressure_policy);
        let (stop, _) = watch::channel(false);

        Self {
            shared: Arc::new(BusShared {
                config,
                codec: Box::new(codec),
                registry: TopicRegistry::new(),
                pipeline: MiddlewarePipeline::new(),
                connection,
                state: Mutex::new(BusState {
                    phase: Phase::Buffering,
                    queue,
                }),
                stats: BusStats::default(),
                stop,
                pending_events: Mutex::new(Some(events_rx)),
            }),
        }
    }

    /// Create a bus that talks WebSocket to `config.endpoint`.
    #[cfg(feature = "websocket")]
    pub fn websocket(config: BusConfig) -> Result<Self> {
        use crate::connection::WebSocketConnector;

        let endpoint = config.endpoint.clone().ok_or(ConfigError::Invalid {
            field: "endpoint",
            reason: "is required for the WebSocket transport".to_string(),
        })?;
        let connector = WebSocketConnector::new(endpoint)?;
        Ok(Self::new(config, connector))
    }

    /// Start the pump and begin connecting in the background.
    ///
    /// No-op if already open. Must be called inside a tokio runtime.
    pub fn open(&self) -> Result<()> {
        self.ensure_usable()?;

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;

        if let Some(events) = lock(&self.shared.pending_events).take() {
            let pump = Pump {
                shared: Arc::downgrade(&self.shared),
                events,
                stop: self.shared.stop.subscribe(),
            };
            runtime.spawn(pump.run());
            info!(
                error_topic = %self.shared.config.error_topic,
                queue_capacity = self.shared.config.outbound_queue_capacity,
                "Message bus opened"
            );
        }

        self.shared.connection.open()?;
        Ok(())
    }

    /// Serialize `payload` and publish it on `topic`.
    pub fn publish<T: Serialize + ?Sized>(
        &self,
        topic: impl Into<String>,
        payload: &T,
    ) -> std::result::Result<PublishOutcome, PublishError> {
        self.ensure_publishable()?;
        let payload = serde_json::to_value(payload)?;
        let envelope = Envelope::new(topic, payload)?;
        self.publish_envelope(envelope)
    }

    /// Publish a pre-built envelope; id and timestamp are kept as given.
    ///
    /// Returns immediately: `Sent` if the connection took the frame,
    /// `Queued` if it was buffered, or a `PublishError`.
    pub fn publish_envelope(
        &self,
        envelope: Envelope,
    ) -> std::result::Result<PublishOutcome, PublishError> {
        let shared = &self.shared;
        self.ensure_publishable()?;

        let envelope = match shared.pipeline.process(envelope, Direction::Outbound) {
            PipelineOutcome::Deliver(envelope) => envelope,
            PipelineOutcome::Halted => {
                BusStats::incr(&shared.stats.middleware_rejections);
                return Ok(PublishOutcome::Filtered);
            }
            PipelineOutcome::Rejected(e) => {
                BusStats::incr(&shared.stats.middleware_rejections);
                return Err(e.into());
            }
        };

        let frame = shared.codec.encode(&envelope)?;
        let topic = envelope.topic();

        let mut state = lock(&shared.state);
        match state.phase {
            Phase::Live => match shared.connection.send(frame.clone()) {
                Ok(()) => {
                    BusStats::incr(&shared.stats.published);
                    BusStats::incr(&shared.stats.sent);
                    debug!(topic = %topic, "Published");
                    Ok(PublishOutcome::Sent)
                }
                Err(e) => {
                    debug!(topic = %topic, error = %e, "Connection not writable, buffering");
                    state.phase = Phase::Buffering;
                    shared.enqueue(&mut state, topic, frame)
                }
            },
            Phase::Buffering => shared.enqueue(&mut state, topic, frame),
            Phase::Failed { .. } | Phase::Closed => Err(PublishError::BusClosed),
        }
    }

    /// Register `handler` for `topic`.
    ///
    /// Fails only once the bus has failed or been closed.
    pub fn subscribe<F>(&self, topic: impl Into<String>, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&Envelope) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.ensure_usable()?;
        Ok(self.shared.registry.subscribe(topic, handler))
    }

    /// Register a handler that receives the payload decoded as `T`.
    ///
    /// A payload that does not decode counts as a handler error.
    pub fn subscribe_payload<T, F>(&self, topic: impl Into<String>, handler: F) -> Result<SubscriptionId>
    where
        T: DeserializeOwned,
        F: Fn(T) -> std::result::Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe(topic, move |envelope: &Envelope| handler(envelope.payload_as()?))
    }

    /// Receive envelopes for `topic` on a channel instead of a callback.
    ///
    /// The subscription removes itself on the first message after the
    /// receiver is dropped.
    pub fn subscribe_channel(
        &self,
        topic: impl Into<String>,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Envelope>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let own_id: Arc<OnceLock<SubscriptionId>> = Arc::new(OnceLock::new());
        let bus = Arc::downgrade(&self.shared);

        let id = self.subscribe(topic, {
            let own_id = Arc::clone(&own_id);
            move |envelope: &Envelope| {
                if tx.send(envelope.clone()).is_err() {
                    if let (Some(id), Some(bus)) = (own_id.get(), bus.upgrade()) {
                        debug!(topic = %envelope.topic(), "Channel receiver dropped, unsubscribing");
                        bus.registry.unsubscribe(*id);
                    }
                }
                Ok(())
            }
        })?;
        let _ = own_id.set(id);
        Ok((id, rx))
    }

    /// Remove one subscription. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.registry.unsubscribe(id);
    }

    /// Remove every subscription for `topic`.
    pub fn clear_topic(&self, topic: &str) {
        self.shared.registry.clear_topic(topic);
    }

    /// Append a middleware; it applies to every message processed afterwards.
    pub fn use_middleware(&self, middleware: impl Middleware + 'static) {
        self.shared.pipeline.push(Arc::new(middleware));
    }

    /// Close the bus. Idempotent and safe from any state, including from
    /// inside a handler.
    ///
    /// Cancels any pending reconnect, discards queued publishes and stops
    /// dispatch. Handlers already running finish; no new dispatch starts.
    pub fn close(&self) {
        let shared = &self.shared;
        let dropped = {
            let mut state = lock(&shared.state);
            if matches!(state.phase, Phase::Closed) {
                return;
            }
            state.phase = Phase::Closed;
            state.queue.clear()
        };
        BusStats::add(&shared.stats.evicted, dropped as u64);

        shared.stop.send_replace(true);
        shared.connection.close();
        info!(dropped, "Message bus closed");
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.connection.state()
    }

    /// Receiver observing every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection.watch_state()
    }

    /// Publishes currently buffered.
    pub fn queued_len(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.shared.registry.subscriber_count(topic)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// Reserved topic carrying the bus's own failure notices.
    pub fn error_topic(&self) -> &str {
        &self.shared.config.error_topic
    }

    fn ensure_usable(&self) -> Result<()> {
        match &lock(&self.shared.state).phase {
            Phase::Failed { attempts, reason } => Err(BusError::Failed {
                attempts: *attempts,
                reason: reason.clone(),
            }),
            Phase::Closed => Err(BusError::Closed),
            Phase::Buffering | Phase::Live => Ok(()),
        }
    }

    fn ensure_publishable(&self) -> std::result::Result<(), PublishError> {
        self.ensure_usable().map_err(|_| PublishError::BusClosed)
    }
}

impl BusShared {
    fn enqueue(
        &self,
        state: &mut BusState,
        topic: &str,
        frame: Bytes,
    ) -> std::result::Result<PublishOutcome, PublishError> {
        match state.queue.push(frame) {
            Ok(Enqueued::Queued) => {
                BusStats::incr(&self.stats.published);
                BusStats::incr(&self.stats.queued);
                debug!(topic = %topic, queued = state.queue.len(), "Buffered while disconnected");
                Ok(PublishOutcome::Queued)
            }
            Ok(Enqueued::QueuedWithEviction(evicted)) => {
                BusStats::incr(&self.stats.published);
                BusStats::incr(&self.stats.queued);
                BusStats::incr(&self.stats.evicted);
                warn!(
                    topic = %topic,
                    evicted_bytes = evicted.len(),
                    capacity = state.queue.capacity(),
                    "Outbound queue full, dropped oldest"
                );
                Ok(PublishOutcome::Queued)
            }
            Err(e) => {
                BusStats::incr(&self.stats.rejected);
                warn!(topic = %topic, capacity = e.capacity, "Outbound queue full, publish rejected");
                Err(e.into())
            }
        }
    }

    fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected | ConnectionEvent::Writable => self.flush(),
            ConnectionEvent::Disconnected { reason, unsent } => self.requeue(reason, unsent),
            ConnectionEvent::Frame(frame) => self.receive(frame),
            ConnectionEvent::Failed { attempts, reason } => self.fail(attempts, reason),
        }
    }

    /// Put frames the lost link never wrote back at the head of the queue.
    fn requeue(&self, reason: String, unsent: Vec<Bytes>) {
        let mut state = lock(&self.state);
        if !matches!(state.phase, Phase::Buffering | Phase::Live) {
            return;
        }
        state.phase = Phase::Buffering;

        let requeued = unsent.len();
        if requeued > 0 {
            state.queue.restore_front(unsent);
            BusStats::sub(&self.stats.sent, requeued as u64);
            BusStats::add(&self.stats.requeued, requeued as u64);
            warn!(
                reason = %reason,
                requeued,
                queued = state.queue.len(),
                "Requeued frames the lost link never wrote"
            );
        } else {
            debug!(reason = %reason, "Buffering publishes until reconnected");
        }
    }

    /// Send everything queued, oldest first, then go live.
    ///
    /// Holds the state lock throughout so no publish can overtake the flush.
    /// Stops early when the connection stops accepting; the rest waits for
    /// the next `Connected` or `Writable`.
    fn flush(&self) {
        let mut state = lock(&self.state);
        if !matches!(state.phase, Phase::Buffering | Phase::Live) {
            return;
        }

        let mut pending = state.queue.drain().into_iter();
        let mut flushed = 0usize;
        while let Some(frame) = pending.next() {
            if let Err(e) = self.connection.send(frame.clone()) {
                let mut unsent = vec![frame];
                unsent.extend(pending);
                if e == ConnectionError::Saturated {
                    debug!(flushed, remaining = unsent.len(), "Write buffer full, flush paused");
                } else {
                    warn!(error = %e, remaining = unsent.len(), "Flush interrupted");
                }
                state.queue.restore_front(unsent);
                state.phase = Phase::Buffering;
                return;
            }
            BusStats::incr(&self.stats.sent);
            flushed += 1;
        }

        state.phase = Phase::Live;
        if flushed > 0 {
            info!(flushed, "Outbound queue flushed");
        }
    }

    fn receive(&self, frame: Bytes) {
        let envelope = match self.codec.decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                BusStats::incr(&self.stats.decode_errors);
                warn!(codec = self.codec.name(), error = %e, "Dropping undecodable frame");
                return;
            }
        };
        debug!(topic = %envelope.topic(), "Received");

        let envelope = match self.pipeline.process(envelope, Direction::Inbound) {
            PipelineOutcome::Deliver(envelope) => envelope,
            PipelineOutcome::Halted | PipelineOutcome::Rejected(_) => {
                BusStats::incr(&self.stats.middleware_rejections);
                return;
            }
        };

        self.deliver(&envelope);
    }

    fn deliver(&self, envelope: &Envelope) {
        let report = self.registry.dispatch(envelope);
        BusStats::add(&self.stats.delivered, report.delivered as u64);
        BusStats::add(&self.stats.handler_errors, report.failed as u64);
    }

    /// Enter the terminal state and announce it once on the error topic.
    fn fail(&self, attempts: u32, reason: String) {
        let dropped = {
            let mut state = lock(&self.state);
            if !matches!(state.phase, Phase::Buffering | Phase::Live) {
                return;
            }
            state.phase = Phase::Failed {
                attempts,
                reason: reason.clone(),
            };
            state.queue.clear()
        };
        BusStats::add(&self.stats.evicted, dropped as u64);

        error!(
            attempts,
            reason = %reason,
            dropped,
            error_topic = %self.config.error_topic,
            "Message bus failed"
        );

        let payload = json!({
            "kind": "bus_failed",
            "reason": reason,
            "attempts": attempts,
            "dropped": dropped,
        });
        // Bypasses middleware: validators must not swallow the failure notice
        match Envelope::new(self.config.error_topic.clone(), payload) {
            Ok(notice) => self.deliver(&notice.stamped()),
            Err(e) => error!(error = %e, "Cannot announce failure without an error topic"),
        }
    }

    fn is_closed(&self) -> bool {
        matches!(lock(&self.state).phase, Phase::Closed)
    }
}

/// Single consumer of connection events; runs every dispatch.
struct Pump {
    shared: Weak<BusShared>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    stop: watch::Receiver<bool>,
}

impl Pump {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.changed() => break,
                event = self.events.recv() => event,
            };

            let Some(event) = event else {
                break;
            };
            let Some(shared) = self.shared.upgrade() else {
                break;
            };
            if *self.stop.borrow() || shared.is_closed() {
                break;
            }

            shared.handle_event(event);
        }
        debug!("Bus pump stopped");
    }
}

#[cfg(test)]
mod tests;

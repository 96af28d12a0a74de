//! Single reconnecting duplex link to the backend.
//!
//! This module contains:
//! - `ConnectionState`: the connection state machine
//! - `Connector` / `FrameSink` traits: the transport seam
//! - `Connection`: the supervisor that connects, pumps frames and
//!   reconnects with exponential backoff
//! - Implementations: in-memory (tests, demos), WebSocket
//!
//! A `Connection` moves opaque frames. It knows nothing about topics,
//! envelopes or codecs; everything it observes is reported to its owner
//! as a `ConnectionEvent`.
//!
//! Frames accepted by `send` wait in a bounded write buffer until the
//! supervisor writes them. A full buffer refuses with `Saturated` and is
//! followed by a `Writable` event once a write completes. When a link is
//! lost, every frame it never wrote is handed back in `Disconnected`.
//!
//! ```text
//!  Disconnected --open()--> Connecting --ok--> Connected
//!                              ^   |              |
//!                     (backoff)|   |fail          |lost
//!                              |   v              v
//!                            Reconnecting <-------+
//!                                  |
//!                           retries exhausted --> Failed
//!
//!  any state --close()--> Closed
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::utils::lock;

mod backoff;
pub mod memory;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use backoff::ReconnectPolicy;
pub use memory::MemoryConnector;
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

/// One unit of data moved over the transport.
pub type Frame = Bytes;

/// Stream of inbound frames for one live link. Ends when the peer closes.
pub type FrameStream = BoxStream<'static, Result<Frame>>;

/// Result type for connection operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Errors that can occur at the transport level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("Connection closed")]
    Closed,

    /// The write buffer is full; a `Writable` event follows once it drains.
    #[error("Write buffer full")]
    Saturated,

    #[error("No tokio runtime available to drive the connection")]
    NoRuntime,
}

/// Connection state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Constructed, `open()` not called yet.
    #[default]
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Link is up; `send` accepts frames.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Retries exhausted. Terminal.
    Failed,
    /// Closed by the owner. Terminal.
    Closed,
}

impl ConnectionState {
    /// `Failed` and `Closed` admit no further transitions (except `Failed -> Closed`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    fn can_transition_to(&self, next: ConnectionState) -> bool {
        match (*self, next) {
            (ConnectionState::Closed, _) => false,
            (_, ConnectionState::Closed) => true,
            (ConnectionState::Failed, _) => false,
            (current, next) => current != next,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Write half of a live link.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame to the peer.
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Close the link. Errors are logged by the caller and otherwise ignored.
    async fn close(&mut self) -> Result<()>;
}

/// A live link: write half plus inbound frame stream.
pub struct Link {
    pub sink: Box<dyn FrameSink>,
    pub stream: FrameStream,
}

impl Link {
    pub fn new(sink: impl FrameSink + 'static, stream: FrameStream) -> Self {
        Self {
            sink: Box::new(sink),
            stream,
        }
    }
}

/// Establishes links to a remote endpoint.
///
/// Implementations:
/// - `MemoryConnector`: scripted in-memory peer for tests
/// - `WebSocketConnector`: WebSocket client (feature `websocket`)
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Perform one connect attempt, including any handshake.
    async fn connect(&self) -> Result<Link>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// What the connection reports to its owner, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A link came up; `send` now accepts frames.
    Connected,
    /// The live link was lost; reconnecting.
    ///
    /// `unsent` holds the frames accepted by `send` that the link never
    /// wrote, oldest first.
    Disconnected { reason: String, unsent: Vec<Frame> },
    /// The write buffer has room again after `send` returned `Saturated`.
    Writable,
    /// An inbound frame arrived.
    Frame(Frame),
    /// Reconnect attempts exhausted. Emitted exactly once.
    Failed { attempts: u32, reason: String },
}

struct ConnectionShared {
    state: watch::Sender<ConnectionState>,
    /// Writer for the current link; `None` while no link is up.
    writer: Mutex<Option<mpsc::Sender<Frame>>>,
    /// Set when `send` found the buffer full; cleared by the next write.
    saturated: AtomicBool,
    stop: watch::Sender<bool>,
}

impl ConnectionShared {
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                debug!(from = %current, to = %next, "Connection state changed");
                *current = next;
                true
            } else {
                false
            }
        })
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Everything the supervisor needs, held until `open()`.
struct Pending {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    write_buffer: usize,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

/// One reconnecting connection to one endpoint.
///
/// `open()` spawns a supervisor task; `send` never waits on the network;
/// `close()` is idempotent and cancels any pending reconnect.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    pending: Mutex<Option<Pending>>,
}

impl Connection {
    /// Create a connection in the `Disconnected` state.
    ///
    /// `write_buffer` bounds the frames accepted but not yet written
    /// (at least 1). Events are delivered on `events` in the order they
    /// occur.
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        write_buffer: usize,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (stop, _) = watch::channel(false);

        Self {
            shared: Arc::new(ConnectionShared {
                state,
                writer: Mutex::new(None),
                saturated: AtomicBool::new(false),
                stop,
            }),
            pending: Mutex::new(Some(Pending {
                connector,
                policy,
                write_buffer: write_buffer.max(1),
                events,
            })),
        }
    }

    /// Start connecting in the background.
    ///
    /// No-op if already opened. Fails with `Closed` after `close()` and with
    /// `NoRuntime` outside a tokio runtime.
    pub fn open(&self) -> Result<()> {
        if self.shared.current() == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;

        let Some(pending) = lock(&self.pending).take() else {
            return Ok(());
        };

        info!(endpoint = %pending.connector.endpoint(), "Opening connection");

        let supervisor = Supervisor {
            shared: Arc::clone(&self.shared),
            stop: self.shared.stop.subscribe(),
            connector: pending.connector,
            policy: pending.policy,
            write_buffer: pending.write_buffer,
            events: pending.events,
        };
        runtime.spawn(supervisor.run());

        Ok(())
    }

    /// Queue a frame on the live link without waiting for the write.
    ///
    /// Fails unless the state is `Connected`, and with `Saturated` while
    /// the write buffer is full.
    pub fn send(&self, frame: Frame) -> Result<()> {
        let state = self.shared.current();
        if state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected(state));
        }

        let writer = lock(&self.shared.writer);
        let Some(writer) = writer.as_ref() else {
            return Err(ConnectionError::NotConnected(self.shared.current()));
        };

        let mut frame = frame;
        loop {
            match writer.try_send(frame) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => {
                    return Err(ConnectionError::NotConnected(self.shared.current()))
                }
                Err(TrySendError::Full(rejected)) => {
                    self.shared.saturated.store(true, Ordering::SeqCst);
                    // Still full after raising the flag: a pending write will clear it
                    if writer.capacity() == 0 {
                        return Err(ConnectionError::Saturated);
                    }
                    frame = rejected;
                }
            }
        }
    }

    /// Close the connection. Safe to call from any state, any number of times.
    pub fn close(&self) {
        lock(&self.pending).take();
        self.shared.stop.send_replace(true);
        lock(&self.shared.writer).take();

        if self.shared.transition(ConnectionState::Closed) {
            info!("Connection closed");
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.current()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// How a live link ended.
enum SessionEnd {
    /// `close()` was called.
    Stopped,
    /// The transport failed or the peer went away.
    Lost { reason: String, unsent: Vec<Frame> },
}

/// Background task owning the connect / pump / backoff loop.
struct Supervisor {
    shared: Arc<ConnectionShared>,
    stop: watch::Receiver<bool>,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    write_buffer: usize,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Supervisor {
    async fn run(mut self) {
        // Consecutive failed reconnect attempts; reset by a successful connect
        let mut failed_attempts: u32 = 0;

        loop {
            if self.shared.stop_requested() || !self.shared.transition(ConnectionState::Connecting)
            {
                break;
            }

            let attempt = tokio::select! {
                biased;
                _ = self.stop.changed() => break,
                result = self.connector.connect() => result,
            };

            let reason = match attempt {
                Ok(link) => {
                    failed_attempts = 0;
                    match self.run_link(link).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Lost { reason, unsent } => {
                            warn!(reason = %reason, unsent = unsent.len(), "Connection lost");
                            let _ = self.events.send(ConnectionEvent::Disconnected {
                                reason: reason.clone(),
                                unsent,
                            });
                            reason
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        endpoint = %self.connector.endpoint(),
                        error = %e,
                        "Connect attempt failed"
                    );
                    e.to_string()
                }
            };

            if !self.policy.should_retry(failed_attempts) {
                if self.shared.transition(ConnectionState::Failed) {
                    error!(
                        endpoint = %self.connector.endpoint(),
                        attempts = failed_attempts,
                        reason = %reason,
                        "Reconnect attempts exhausted, connection failed"
                    );
                    let _ = self.events.send(ConnectionEvent::Failed {
                        attempts: failed_attempts,
                        reason,
                    });
                }
                break;
            }

            failed_attempts += 1;
            let delay = self.policy.delay_for_attempt(failed_attempts);
            if !self.shared.transition(ConnectionState::Reconnecting) {
                break;
            }
            warn!(
                attempt = failed_attempts,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after backoff"
            );

            tokio::select! {
                biased;
                _ = self.stop.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        lock(&self.shared.writer).take();
        debug!("Connection supervisor stopped");
    }

    /// Pump frames in both directions until the link ends.
    async fn run_link(&mut self, mut link: Link) -> SessionEnd {
        let (writer, mut outbound) = mpsc::channel(self.write_buffer);
        self.shared.saturated.store(false, Ordering::SeqCst);
        *lock(&self.shared.writer) = Some(writer);

        if !self.shared.transition(ConnectionState::Connected) {
            lock(&self.shared.writer).take();
            Self::close_link(&mut link).await;
            return SessionEnd::Stopped;
        }
        info!(endpoint = %self.connector.endpoint(), "Connected");
        let _ = self.events.send(ConnectionEvent::Connected);

        // Frame whose write failed; it goes back ahead of the buffer
        let mut failed_write = None;
        let reason = loop {
            tokio::select! {
                biased;
                _ = self.stop.changed() => break None,
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        let written = tokio::select! {
                            biased;
                            _ = self.stop.changed() => None,
                            result = link.sink.send(frame.clone()) => Some(result),
                        };
                        match written {
                            None => break None,
                            Some(Err(e)) => {
                                failed_write = Some(frame);
                                break Some(e.to_string());
                            }
                            Some(Ok(())) => {
                                if self.shared.saturated.swap(false, Ordering::SeqCst) {
                                    let _ = self.events.send(ConnectionEvent::Writable);
                                }
                            }
                        }
                    }
                    // Writer dropped: only `close()` does that
                    None => break None,
                },
                inbound = link.stream.next() => match inbound {
                    Some(Ok(frame)) => {
                        if self.events.send(ConnectionEvent::Frame(frame)).is_err() {
                            break None;
                        }
                    }
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break Some("closed by peer".to_string()),
                },
            }
        };

        // No `send` can reach the buffer once the writer is gone
        lock(&self.shared.writer).take();

        let Some(reason) = reason else {
            Self::close_link(&mut link).await;
            return SessionEnd::Stopped;
        };

        let mut unsent: Vec<Frame> = failed_write.into_iter().collect();
        outbound.close();
        while let Ok(frame) = outbound.try_recv() {
            unsent.push(frame);
        }
        SessionEnd::Lost { reason, unsent }
    }

    async fn close_link(link: &mut Link) {
        if let Err(e) = link.sink.close().await {
            debug!(error = %e, "Error while closing link");
        }
    }
}

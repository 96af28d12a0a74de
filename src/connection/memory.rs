//! In-memory transport for tests and local demos.
//!
//! `MemoryConnector` plays the remote endpoint: it can be scripted to
//! refuse connections or fail and stall writes, records when each attempt
//! happened, captures every frame the client writes, and lets the caller
//! push inbound frames or cut the live link.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::channel::mpsc as futures_mpsc;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;

use super::{ConnectionError, Connector, Frame, FrameSink, Link, Result};
use crate::utils::lock;

type InboundSender = futures_mpsc::UnboundedSender<Result<Frame>>;

#[derive(Default)]
struct MemoryState {
    /// Scripted outcomes for upcoming attempts; `true` = refuse.
    script: VecDeque<bool>,
    refuse_all: bool,
    attempts: Vec<Instant>,
    /// Successful writes left before the next one fails.
    writes_before_failure: Option<usize>,
    sent: Vec<Frame>,
    /// Inbound side of the live link, tagged with its generation.
    live: Option<(u64, InboundSender)>,
    generation: u64,
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    sent_count: watch::Sender<usize>,
    attempt_count: watch::Sender<usize>,
    stalled: watch::Sender<bool>,
}

/// Scripted in-memory endpoint. Clones share the same endpoint.
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// An endpoint that accepts every connection.
    pub fn new() -> Self {
        let (sent_count, _) = watch::channel(0);
        let (attempt_count, _) = watch::channel(0);
        let (stalled, _) = watch::channel(false);
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState::default()),
                sent_count,
                attempt_count,
                stalled,
            }),
        }
    }

    /// An endpoint that refuses every connection.
    pub fn refusing() -> Self {
        let connector = Self::new();
        connector.set_refuse_all(true);
        connector
    }

    /// Refuse the next `n` connect attempts, then fall back to the default.
    pub fn fail_next(&self, n: usize) {
        lock(&self.inner.state).script.extend(std::iter::repeat(true).take(n));
    }

    /// Refuse (or accept) every attempt not covered by `fail_next`.
    pub fn set_refuse_all(&self, refuse: bool) {
        lock(&self.inner.state).refuse_all = refuse;
    }

    /// Let `n` more writes succeed, then fail the next one and cut the link.
    pub fn fail_writes_after(&self, n: usize) {
        lock(&self.inner.state).writes_before_failure = Some(n);
    }

    /// While stalled, writes do not complete.
    pub fn stall_writes(&self, stalled: bool) {
        self.inner.stalled.send_replace(stalled);
    }

    /// When each connect attempt happened (tokio clock).
    pub fn connect_attempts(&self) -> Vec<Instant> {
        lock(&self.inner.state).attempts.clone()
    }

    /// Every frame written by the client, in write order.
    pub fn sent_frames(&self) -> Vec<Frame> {
        lock(&self.inner.state).sent.clone()
    }

    /// Sent frames decoded as UTF-8 (lossy).
    pub fn sent_text(&self) -> Vec<String> {
        self.sent_frames()
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .collect()
    }

    /// Wait until at least `n` frames have been written.
    pub async fn wait_for_sent(&self, n: usize) {
        let mut rx = self.inner.sent_count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Wait until at least `n` connect attempts have been made.
    pub async fn wait_for_attempts(&self, n: usize) {
        let mut rx = self.inner.attempt_count.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Whether a link is currently up.
    pub fn is_linked(&self) -> bool {
        lock(&self.inner.state).live.is_some()
    }

    /// Deliver a frame to the client. Returns `false` if no link is up.
    pub fn inject(&self, frame: impl Into<Frame>) -> bool {
        self.push_inbound(Ok(frame.into()))
    }

    /// Fail the live link with a transport error.
    pub fn inject_error(&self, reason: &str) -> bool {
        self.push_inbound(Err(ConnectionError::Transport(reason.to_string())))
    }

    /// Cut the live link as if the peer went away.
    pub fn drop_link(&self) -> bool {
        lock(&self.inner.state).live.take().is_some()
    }

    fn push_inbound(&self, item: Result<Frame>) -> bool {
        let state = lock(&self.inner.state);
        match &state.live {
            Some((_, tx)) => tx.unbounded_send(item).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Link> {
        let mut state = lock(&self.inner.state);
        state.attempts.push(Instant::now());
        let attempts = state.attempts.len();
        self.inner.attempt_count.send_replace(attempts);

        let refuse = state.script.pop_front().unwrap_or(state.refuse_all);
        if refuse {
            return Err(ConnectionError::Connect(format!(
                "memory endpoint refused attempt {}",
                attempts
            )));
        }

        let (tx, rx) = futures_mpsc::unbounded();
        state.generation += 1;
        let generation = state.generation;
        state.live = Some((generation, tx));

        let sink = MemorySink {
            inner: Arc::clone(&self.inner),
            generation,
        };
        Ok(Link::new(sink, rx.boxed()))
    }

    fn endpoint(&self) -> String {
        "memory://".to_string()
    }
}

/// Write half of one in-memory link.
struct MemorySink {
    inner: Arc<MemoryInner>,
    generation: u64,
}

impl MemorySink {
    fn is_current(state: &MemoryState, generation: u64) -> bool {
        matches!(&state.live, Some((live, _)) if *live == generation)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let mut stalled = self.inner.stalled.subscribe();
        let _ = stalled.wait_for(|stalled| !*stalled).await;

        let count = {
            let mut state = lock(&self.inner.state);
            if !Self::is_current(&state, self.generation) {
                return Err(ConnectionError::Transport("memory link dropped".to_string()));
            }
            match state.writes_before_failure {
                Some(0) => {
                    state.writes_before_failure = None;
                    state.live = None;
                    return Err(ConnectionError::Transport("memory write failed".to_string()));
                }
                Some(n) => state.writes_before_failure = Some(n - 1),
                None => {}
            }
            state.sent.push(frame);
            state.sent.len()
        };
        self.inner.sent_count.send_replace(count);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if Self::is_current(&state, self.generation) {
            state.live = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_capture_frames() {
        let connector = MemoryConnector::new();
        let mut link = connector.connect().await.unwrap();
        assert!(connector.is_linked());

        link.sink.send(Frame::from_static(b"one")).await.unwrap();
        link.sink.send(Frame::from_static(b"two")).await.unwrap();

        assert_eq!(connector.sent_text(), vec!["one", "two"]);
        assert_eq!(connector.connect_attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let connector = MemoryConnector::new();
        connector.fail_next(2);

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.connect_attempts().len(), 3);
    }

    #[tokio::test]
    async fn test_refusing_endpoint() {
        let connector = MemoryConnector::refusing();
        let result = connector.connect().await;
        assert!(matches!(result, Err(ConnectionError::Connect(_))));
        assert!(!connector.is_linked());
    }

    #[tokio::test]
    async fn test_inject_reaches_stream() {
        let connector = MemoryConnector::new();
        let mut link = connector.connect().await.unwrap();

        assert!(connector.inject(Frame::from_static(b"hello")));
        let frame = link.stream.next().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
    }

    #[tokio::test]
    async fn test_drop_link_ends_stream_and_rejects_writes() {
        let connector = MemoryConnector::new();
        let mut link = connector.connect().await.unwrap();

        assert!(connector.drop_link());
        assert!(link.stream.next().await.is_none());
        assert!(link.sink.send(Frame::from_static(b"late")).await.is_err());
        assert!(!connector.inject(Frame::from_static(b"nobody")));
    }

    #[tokio::test]
    async fn test_scripted_write_failure_cuts_link() {
        let connector = MemoryConnector::new();
        let mut link = connector.connect().await.unwrap();
        connector.fail_writes_after(1);

        link.sink.send(Frame::from_static(b"kept")).await.unwrap();
        assert!(link.sink.send(Frame::from_static(b"lost")).await.is_err());
        assert!(!connector.is_linked());
        assert_eq!(connector.sent_text(), vec!["kept"]);

        // Applies once: the next link writes normally
        let mut link = connector.connect().await.unwrap();
        link.sink.send(Frame::from_static(b"again")).await.unwrap();
        assert_eq!(connector.sent_text(), vec!["kept", "again"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_writes_complete_when_released() {
        let connector = MemoryConnector::new();
        let mut link = connector.connect().await.unwrap();
        connector.stall_writes(true);

        let write = tokio::spawn(async move { link.sink.send(Frame::from_static(b"slow")).await });
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert!(connector.sent_frames().is_empty());

        connector.stall_writes(false);
        write.await.unwrap().unwrap();
        assert_eq!(connector.sent_text(), vec!["slow"]);
    }

    #[tokio::test]
    async fn test_stale_sink_cannot_close_new_link() {
        let connector = MemoryConnector::new();
        let mut old = connector.connect().await.unwrap();
        let _new = connector.connect().await.unwrap();

        old.sink.close().await.unwrap();
        assert!(connector.is_linked());
    }
}

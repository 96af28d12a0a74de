//! WebSocket transport built on tokio-tungstenite.
//!
//! Frames that are valid UTF-8 go out as text messages, everything else as
//! binary. Inbound text and binary messages both become frames; control
//! messages are handled by tungstenite and never surface.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{ConnectionError, Connector, Frame, FrameSink, Link, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a `ws://` or `wss://` URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Fails with `Connect` unless the URL uses a WebSocket scheme.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConnectionError::Connect(format!(
                "unsupported endpoint '{}', expected ws:// or wss://",
                url
            )));
        }
        Ok(Self { url })
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Link> {
        let (ws, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))?;
        debug!(url = %self.url, status = %response.status(), "WebSocket handshake complete");

        let (sink, stream) = ws.split();
        let frames = stream
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(Bytes::from(text))),
                    Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                    Ok(_) => None,
                    Err(e) => Some(Err(ConnectionError::Transport(e.to_string()))),
                }
            })
            .boxed();

        Ok(Link::new(WebSocketSink { sink }, frames))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

struct WebSocketSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match String::from_utf8(frame.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Binary(e.into_bytes()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accept one client and echo every data message back.
    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if message.is_text() || message.is_binary() {
                    if ws.send(message).await.is_err() {
                        break;
                    }
                }
            }
        });

        format!("ws://{}", addr)
    }

    #[test]
    fn test_rejects_non_websocket_scheme() {
        assert!(WebSocketConnector::new("http://localhost:80").is_err());
        assert!(WebSocketConnector::new("ws://localhost:80").is_ok());
        assert!(WebSocketConnector::new("wss://example.com/bus").is_ok());
    }

    #[tokio::test]
    async fn test_echo_text_and_binary() {
        let url = spawn_echo_server().await;
        let connector = WebSocketConnector::new(url).unwrap();
        let mut link = connector.connect().await.unwrap();

        link.sink.send(Bytes::from_static(b"{\"topic\":\"t\"}")).await.unwrap();
        let echoed = link.stream.next().await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"{\"topic\":\"t\"}");

        link.sink.send(Bytes::from_static(&[0xff, 0x00, 0x01])).await.unwrap();
        let echoed = link.stream.next().await.unwrap().unwrap();
        assert_eq!(&echoed[..], &[0xff, 0x00, 0x01]);

        link.sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WebSocketConnector::new(format!("ws://{}", addr)).unwrap();
        let result = connector.connect().await;
        assert!(matches!(result, Err(ConnectionError::Connect(_))));
    }
}

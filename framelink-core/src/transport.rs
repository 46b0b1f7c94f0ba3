//! Connection seam and the WebSocket transport
//!
//! The session controller never touches a socket directly: it asks a
//! [`Connector`] for an [`Established`] link, sends through the returned
//! [`Connection`] and reads [`TransportEvent`]s from the paired receiver.
//! [`WebSocketConnector`] is the production implementation over
//! `tokio-tungstenite`.

use crate::error::{FramelinkError, FramelinkResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

/// WebSocket close status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Closure initiated on purpose; never triggers a reconnect
    pub const NORMAL: CloseCode = CloseCode(1000);
    /// Endpoint is going away
    pub const GOING_AWAY: CloseCode = CloseCode(1001);
    /// Close frame carried no status
    pub const NO_STATUS: CloseCode = CloseCode(1005);
    /// Connection dropped without a close frame
    pub const ABNORMAL: CloseCode = CloseCode(1006);

    /// Whether this is a normal closure
    pub fn is_normal(&self) -> bool {
        *self == CloseCode::NORMAL
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something that happened on an established connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A text message arrived
    Text(String),
    /// A binary message arrived
    Binary(Bytes),
    /// The connection is gone; always the last event
    Closed {
        /// Close code reported by the peer, or [`CloseCode::ABNORMAL`]
        code: CloseCode,
        /// Close reason or transport error text
        reason: String,
    },
}

/// Sending half of an established connection
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Endpoint this connection was opened to
    fn endpoint(&self) -> &str;

    /// Whether messages can currently be sent
    fn is_open(&self) -> bool;

    /// Send one text message
    async fn send_text(&self, text: String) -> FramelinkResult<()>;

    /// Close the connection with the given code
    ///
    /// Closing an already closed connection is not an error.
    async fn close(&self, code: CloseCode, reason: &str) -> FramelinkResult<()>;
}

/// A freshly opened connection and its inbound event stream
#[derive(Debug)]
pub struct Established {
    /// Sending half
    pub connection: Arc<dyn Connection>,
    /// Inbound messages in receipt order, terminated by [`TransportEvent::Closed`]
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens connections to an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform the handshake with `endpoint`
    async fn connect(&self, endpoint: &str) -> FramelinkResult<Established>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector for `ws://` and `wss://` endpoints
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new WebSocket connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> FramelinkResult<Established> {
        let (stream, _response) =
            connect_async(endpoint)
                .await
                .map_err(|e| FramelinkError::Connection {
                    endpoint: endpoint.to_string(),
                    reason: format!("WebSocket handshake failed: {}", e),
                })?;

        debug!(endpoint, "WebSocket connection established");

        let (sink, source) = stream.split();
        let open = Arc::new(AtomicBool::new(true));
        let (event_tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(source, open.clone(), event_tx));

        let connection = WebSocketConnection {
            endpoint: endpoint.to_string(),
            sink: tokio::sync::Mutex::new(sink),
            open,
            reader: Mutex::new(Some(reader)),
        };

        Ok(Established {
            connection: Arc::new(connection),
            events,
        })
    }
}

/// Client side of a WebSocket connection
pub struct WebSocketConnection {
    endpoint: String,
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    open: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("endpoint", &self.endpoint)
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> FramelinkResult<()> {
        if !self.is_open() {
            return Err(FramelinkError::Transmission {
                reason: "connection is not open".to_string(),
            });
        }

        let len = text.len();
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| FramelinkError::Transmission {
                reason: format!("WebSocket send failed: {}", e),
            })?;

        trace!(endpoint = %self.endpoint, bytes = len, "message sent");
        Ok(())
    }

    async fn close(&self, code: CloseCode, reason: &str) -> FramelinkResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let frame = CloseFrame {
            code: WsCloseCode::from(code.0),
            reason: Cow::Owned(reason.to_string()),
        };

        if let Err(e) = self.sink.lock().await.send(Message::Close(Some(frame))).await {
            // The peer may already be gone; the connection is closed either way
            debug!(endpoint = %self.endpoint, "close frame not delivered: {}", e);
        }

        debug!(endpoint = %self.endpoint, %code, "WebSocket connection closed");
        Ok(())
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn read_loop(
    mut source: SplitStream<WsStream>,
    open: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (code, reason) = loop {
        let event = match source.next().await {
            Some(Ok(Message::Text(text))) => TransportEvent::Text(text),
            Some(Ok(Message::Binary(data))) => TransportEvent::Binary(Bytes::from(data)),
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => (CloseCode(u16::from(frame.code)), frame.reason.into_owned()),
                    None => (CloseCode::NO_STATUS, String::new()),
                };
            }
            // Ping/pong control frames are answered by tungstenite itself
            Some(Ok(_)) => continue,
            Some(Err(e)) => break (CloseCode::ABNORMAL, e.to_string()),
            None => break (CloseCode::ABNORMAL, "stream ended".to_string()),
        };

        if events.send(event).is_err() {
            // Nobody is listening any more
            break (CloseCode::NORMAL, String::new());
        }
    };

    open.store(false, Ordering::SeqCst);
    let _ = events.send(TransportEvent::Closed { code, reason });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert!(CloseCode::NORMAL.is_normal());
        assert!(!CloseCode::ABNORMAL.is_normal());
        assert!(!CloseCode::GOING_AWAY.is_normal());
        assert_eq!(CloseCode(4000).to_string(), "4000");
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Port 9 (discard) is closed on any sane test host
        let result = WebSocketConnector::new().connect("ws://127.0.0.1:9/ws").await;

        match result {
            Err(FramelinkError::Connection { endpoint, .. }) => {
                assert_eq!(endpoint, "ws://127.0.0.1:9/ws");
            }
            other => panic!("Expected connection error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_invalid_url_is_connection_error() {
        let result = WebSocketConnector::new().connect("not a url").await;
        assert!(matches!(result, Err(FramelinkError::Connection { .. })));
    }
}

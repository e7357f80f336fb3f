//! Session-scoped streaming transport
//!
//! One WebSocket per session. The socket is split so the receive loop and
//! the capture sender never contend: the sink and the stream each sit behind
//! their own async mutex. A `watch` flag marks closure, which unblocks a
//! pending `receive()` and makes later `send()` calls fail fast.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use super::protocol::{InboundMessage, OutboundMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the peer vanished without a close frame
const ABNORMAL_CLOSURE: u16 = 1006;

/// How long `close()` waits for the close handshake to flush
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Low-level transport failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// DNS, TCP, TLS or upgrade failure
    #[error("connect failed: {0}")]
    Connect(String),

    /// Operation did not finish in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Closed gracefully by either side; also returned by `send` after `close`
    #[error("connection closed")]
    ConnectionClosed,

    /// Closed abnormally (error close code, stream error, or vanished peer)
    #[error("connection aborted ({code}): {reason}")]
    Aborted { code: u16, reason: String },

    /// Writing a frame failed
    #[error("send failed: {0}")]
    Send(String),

    /// Message could not be serialized
    #[error("encode failed: {0}")]
    Encode(String),
}

impl TransportError {
    /// Whether this is a graceful closure rather than a failure
    #[must_use]
    pub const fn is_graceful(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

/// Opens transports
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `url`
    async fn connect(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

/// An open streaming connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// Wait for the next inbound message or a terminal error
    async fn receive(&self) -> Result<InboundMessage, TransportError>;

    /// Close the connection; idempotent
    async fn close(&self);
}

/// Connects WebSocket transports with a bounded timeout
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError> {
        tracing::debug!(url = %redact(url), "connecting websocket");

        let (ws_stream, response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout(self.connect_timeout))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        tracing::info!(status = %response.status(), "websocket connected");

        Ok(Arc::new(WsTransport::new(ws_stream)))
    }
}

/// WebSocket transport
pub struct WsTransport {
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    closed: watch::Sender<bool>,
}

impl WsTransport {
    fn new(ws_stream: WsStream) -> Self {
        let (sink, stream) = ws_stream.split();
        let (closed, _) = watch::channel(false);
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn mark_closed(&self) {
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let json = message
            .to_json()
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        let mut sink = self.sink.lock().await;
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        sink.send(Message::Text(json.into())).await.map_err(|e| {
            tracing::debug!(error = %e, "websocket send failed");
            TransportError::Send(e.to_string())
        })
    }

    async fn receive(&self) -> Result<InboundMessage, TransportError> {
        let mut closed_rx = self.closed.subscribe();
        if *closed_rx.borrow_and_update() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut stream = tokio::select! {
            guard = self.stream.lock() => guard,
            () = wait_closed(&mut closed_rx) => return Err(TransportError::ConnectionClosed),
        };

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                () = wait_closed(&mut closed_rx) => return Err(TransportError::ConnectionClosed),
            };

            match next {
                Some(Ok(Message::Text(text))) => return Ok(InboundMessage::parse(text.as_str())),
                Some(Ok(Message::Binary(bytes))) => return Ok(InboundMessage::parse_bytes(&bytes)),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "websocket closed by peer");
                    self.mark_closed();
                    return Err(close_error(frame));
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "websocket stream error");
                    self.mark_closed();
                    return Err(TransportError::Aborted {
                        code: ABNORMAL_CLOSURE,
                        reason: e.to_string(),
                    });
                }
                None => {
                    self.mark_closed();
                    return Err(TransportError::Aborted {
                        code: ABNORMAL_CLOSURE,
                        reason: "stream ended without close frame".to_string(),
                    });
                }
            }
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        let flush = async {
            let mut sink = self.sink.lock().await;
            sink.close().await
        };

        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush).await {
            Ok(Ok(())) => tracing::debug!("websocket closed"),
            Ok(Err(e)) => tracing::debug!(error = %e, "websocket close handshake failed"),
            Err(_) => tracing::debug!("websocket close handshake timed out"),
        }
    }
}

/// Resolve once the closed flag is set (or its sender is gone)
async fn wait_closed(closed_rx: &mut watch::Receiver<bool>) {
    loop {
        let closed = *closed_rx.borrow_and_update();
        if closed || closed_rx.changed().await.is_err() {
            return;
        }
    }
}

fn close_error(frame: Option<CloseFrame>) -> TransportError {
    match frame {
        None => TransportError::ConnectionClosed,
        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
            TransportError::ConnectionClosed
        }
        Some(frame) => TransportError::Aborted {
            code: u16::from(frame.code),
            reason: frame.reason.as_str().to_string(),
        },
    }
}

/// Strip query parameters (API keys) from a URL for logging
fn redact(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_classification() {
        assert_eq!(close_error(None), TransportError::ConnectionClosed);
        assert!(
            close_error(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            }))
            .is_graceful()
        );
        assert_eq!(
            close_error(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "quota".into(),
            })),
            TransportError::Aborted {
                code: 1008,
                reason: "quota".to_string()
            }
        );
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact("wss://host/path?key=secret"), "wss://host/path");
        assert_eq!(redact("wss://host/path"), "wss://host/path");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = WsConnector::new(Duration::from_secs(2));
        let result = connector.connect("ws://127.0.0.1:9/").await;
        assert!(matches!(
            result,
            Err(TransportError::Connect(_) | TransportError::Timeout(_))
        ));
    }
}

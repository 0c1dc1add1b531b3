//! Push-stream transport abstraction.
//!
//! The connection manager only ever sees [`PushTransport`] / [`PushSocket`]:
//! open a socket, pull text frames off it, close it. Production uses the
//! WebSocket implementation below; tests inject scripted transports to drive
//! the reconnect state machine deterministically.
//!
//! The client never writes application frames to the socket — the stream is
//! server-push only, and heartbeat/stop-viewing notifications go out over
//! separate HTTP write endpoints (see [`crate::heartbeat`]).

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::RealtimeError;

/// One open push-stream socket.
#[async_trait]
pub trait PushSocket: Send {
    /// Next raw text frame.
    ///
    /// `None` means the peer closed the stream; `Some(Err(_))` is a
    /// transport-level error after which the stream is unusable.
    async fn next_frame(&mut self) -> Option<Result<String, RealtimeError>>;

    /// Close the socket. Best-effort; errors are ignored.
    async fn close(&mut self);
}

/// Factory for push-stream sockets, one per (re)connect attempt.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn PushSocket>, RealtimeError>;
}

/// WebSocket transport: each text frame carries one JSON envelope.
pub struct WebSocketTransport;

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn PushSocket>, RealtimeError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;
        Ok(Box::new(WebSocketPushSocket { stream }))
    }
}

struct WebSocketPushSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushSocket for WebSocketPushSocket {
    async fn next_frame(&mut self) -> Option<Result<String, RealtimeError>> {
        loop {
            return match self.stream.next().await? {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    match String::from_utf8(bytes) {
                        Ok(text) => Some(Ok(text)),
                        Err(_) => {
                            log::debug!("dropping non-UTF-8 binary frame");
                            continue;
                        }
                    }
                }
                // Keepalive traffic is transport-internal.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(_)) => None,
                Err(e) => Some(Err(RealtimeError::Transport(e.to_string()))),
            };
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

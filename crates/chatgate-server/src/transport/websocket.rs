//! WebSocket listener using tokio-tungstenite.
//!
//! Each accepted connection becomes a [`MessageChannel`] carrying one JSON
//! envelope per WebSocket message.

use chatgate_core::{GateError, GateResult, MessageChannel};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

/// Maximum accepted message size (1 MiB).
pub const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Protocol limits applied while reading, before a message is buffered.
fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_WS_FRAME_SIZE);
    config.max_frame_size = Some(MAX_WS_FRAME_SIZE);
    config
}

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    /// The upgraded WebSocket stream.
    pub ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    /// Remote address.
    pub remote_addr: SocketAddr,
}

/// Bind the TCP listener for WebSocket clients.
pub async fn bind(bind_addr: SocketAddr) -> GateResult<TcpListener> {
    TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GateError::Transport(format!("WS bind failed: {e}")))
}

/// Start accepting WebSocket upgrades on `tcp_listener`.
///
/// Returns a receiver that yields upgraded connections. The accept loop ends
/// once the receiver is dropped.
pub fn start_listener(tcp_listener: TcpListener) -> mpsc::Receiver<WebSocketConnection> {
    if let Ok(addr) = tcp_listener.local_addr() {
        info!(addr = %addr, "WebSocket listener started");
    }

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = tcp_listener.accept() => accepted,
                _ = tx.closed() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let handshake =
                            tokio_tungstenite::accept_async_with_config(stream, Some(ws_config()))
                                .await;
                        match handshake {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket accept loop stopped");
    });

    rx
}

impl MessageChannel for WebSocketConnection {
    /// Sends UTF-8 payloads as text messages, anything else as binary.
    fn send<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let message = match std::str::from_utf8(data) {
                Ok(text) => Message::text(text.to_owned()),
                Err(_) => Message::binary(data.to_vec()),
            };
            self.ws_stream
                .send(message)
                .await
                .map_err(|e| GateError::Transport(format!("WS send failed: {e}")))
        })
    }

    /// Accepts text and binary messages. Messages over 1 MiB are refused by
    /// tungstenite while reading and surface as a transport error. Pings are
    /// answered by tungstenite on the next read or write.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = GateResult<Option<Vec<u8>>>> + Send + '_>> {
        Box::pin(async move {
            loop {
                match self.ws_stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                    Some(Ok(Message::Binary(data))) => return Ok(Some(data.to_vec())),
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(GateError::Transport(format!("WS recv failed: {e}")));
                    }
                }
            }
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + '_>> {
        Box::pin(async move {
            match self.ws_stream.close(None).await {
                Ok(())
                | Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
                Err(e) => Err(GateError::Transport(format!("WS close failed: {e}"))),
            }
        })
    }
}

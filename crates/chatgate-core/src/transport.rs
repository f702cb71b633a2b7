//! Abstract duplex message channel for chatgate sessions.
//!
//! A session owns exactly one channel. The WebSocket implementation lives in
//! the server crate; [`MemoryChannel`] backs tests and in-process embedding.

use crate::error::{GateError, GateResult};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// A message-oriented bidirectional channel to one client.
pub trait MessageChannel: Send {
    /// Send one complete message.
    fn send<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + 'a>>;

    /// Receive the next message. `Ok(None)` means the peer closed the channel.
    fn recv(&mut self) -> Pin<Box<dyn Future<Output = GateResult<Option<Vec<u8>>>> + Send + '_>>;

    /// Close the channel. Idempotent.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + '_>>;
}

impl<C: MessageChannel + ?Sized> MessageChannel for Box<C> {
    fn send<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + 'a>> {
        (**self).send(data)
    }

    fn recv(&mut self) -> Pin<Box<dyn Future<Output = GateResult<Option<Vec<u8>>>> + Send + '_>> {
        (**self).recv()
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + '_>> {
        (**self).close()
    }
}

/// In-memory channel endpoint. Created in connected pairs.
#[derive(Debug)]
pub struct MemoryChannel {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryChannel {
    /// Create two connected endpoints.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }

    /// Whether this endpoint has been closed locally.
    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

impl MessageChannel for MemoryChannel {
    fn send<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let tx = self
                .tx
                .as_ref()
                .ok_or_else(|| GateError::Transport("channel closed".into()))?;
            tx.send(data.to_vec())
                .map_err(|_| GateError::Transport("peer disconnected".into()))
        })
    }

    fn recv(&mut self) -> Pin<Box<dyn Future<Output = GateResult<Option<Vec<u8>>>> + Send + '_>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = GateResult<()>> + Send + '_>> {
        Box::pin(async move {
            self.tx = None;
            self.rx.close();
            Ok(())
        })
    }
}

//! Duplex message transport.
//!
//! The dispatcher and the client speak to the wire only through
//! [`MessageSink`] and [`MessageSource`]. [`websocket`] adapts both ends of
//! a WebSocket; [`channel`] is the in-process pair used by tests and
//! embedders.

pub mod websocket;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::GatewayError;

/// Outgoing half of a duplex stream.
#[async_trait]
pub trait MessageSink<T: Send + 'static>: Send + fmt::Debug {
    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the peer is gone.
    async fn send(&mut self, msg: T) -> Result<(), GatewayError>;

    /// Closes the outgoing half. Further sends fail.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the close frame cannot be sent.
    async fn close(&mut self) -> Result<(), GatewayError>;
}

/// Incoming half of a duplex stream.
#[async_trait]
pub trait MessageSource<T: Send + 'static>: Send + fmt::Debug {
    /// Receives one message; `Ok(None)` is a clean end of stream.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for a frame that does not
    /// decode (the stream stays usable) and [`GatewayError::Transport`]
    /// when the stream broke.
    async fn recv(&mut self) -> Result<Option<T>, GatewayError>;
}

/// In-process sink backed by an `mpsc` channel.
#[derive(Debug)]
pub struct ChannelSink<T> {
    tx: Option<mpsc::Sender<Result<T, GatewayError>>>,
}

impl<T> ChannelSink<T> {
    /// Makes the peer's next `recv` fail with `err`, then closes.
    pub async fn fail(&mut self, err: GatewayError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(err)).await;
        }
    }
}

#[async_trait]
impl<T: Send + fmt::Debug + 'static> MessageSink<T> for ChannelSink<T> {
    async fn send(&mut self, msg: T) -> Result<(), GatewayError> {
        let Some(tx) = &self.tx else {
            return Err(GatewayError::Transport("sink closed".to_string()));
        };
        tx.send(Ok(msg))
            .await
            .map_err(|_| GatewayError::Transport("peer dropped".to_string()))
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        self.tx = None;
        Ok(())
    }
}

/// In-process source backed by an `mpsc` channel.
#[derive(Debug)]
pub struct ChannelSource<T> {
    rx: mpsc::Receiver<Result<T, GatewayError>>,
}

#[async_trait]
impl<T: Send + fmt::Debug + 'static> MessageSource<T> for ChannelSource<T> {
    async fn recv(&mut self) -> Result<Option<T>, GatewayError> {
        self.rx.recv().await.transpose()
    }
}

/// Creates a connected in-process sink/source pair.
#[must_use]
pub fn channel<T>(capacity: usize) -> (ChannelSink<T>, ChannelSource<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink { tx: Some(tx) }, ChannelSource { rx })
}

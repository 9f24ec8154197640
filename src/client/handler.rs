//! Client-side event handlers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::GatewayError;
use crate::ws::messages::EventMessage;

/// Receives the events of one subscription.
///
/// Only event types inside the subscription's capability set reach
/// [`EventHandler::handle`]; anything else cancels the subscription and
/// arrives as a [`GatewayError::ProtocolViolation`] through
/// [`EventHandler::error`]. Exactly one of `on_close` and `error` is the
/// last call a handler receives.
#[async_trait]
pub trait EventHandler: Send + Sync + fmt::Debug {
    /// Handles one event. An error cancels the subscription.
    ///
    /// # Errors
    ///
    /// Any error the handler chooses to report; it is passed back through
    /// [`EventHandler::error`].
    async fn handle(&self, event: EventMessage) -> Result<(), GatewayError>;

    /// Subscription ended cleanly.
    async fn on_close(&self) {}

    /// Subscription ended abnormally.
    async fn error(&self, err: GatewayError) {
        tracing::warn!(error = %err, "subscription ended with error");
    }
}

/// What a [`ChannelHandler`] observed.
#[derive(Debug, Clone)]
pub enum HandlerEvent {
    /// Delivered event.
    Event(EventMessage),
    /// Clean close.
    Closed,
    /// Abnormal end.
    Error(GatewayError),
}

/// Handler that forwards everything into an unbounded channel.
#[derive(Debug)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<HandlerEvent>,
}

impl ChannelHandler {
    /// Creates a handler and the receiver of its observations.
    #[must_use]
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<HandlerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl EventHandler for ChannelHandler {
    async fn handle(&self, event: EventMessage) -> Result<(), GatewayError> {
        self.tx
            .send(HandlerEvent::Event(event))
            .map_err(|_| GatewayError::Internal("handler receiver dropped".to_string()))
    }

    async fn on_close(&self) {
        let _ = self.tx.send(HandlerEvent::Closed);
    }

    async fn error(&self, err: GatewayError) {
        let _ = self.tx.send(HandlerEvent::Error(err));
    }
}

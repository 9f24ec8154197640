//! Topic-keyed live feed of aggregate and owner events.
//!
//! [`EventBus`] wraps a [`tokio::sync::broadcast`] channel. Every event the
//! store accepts is published through the bus; consumers subscribe to one
//! [`Topic`] and receive only that topic's messages through a
//! [`FeedReceiver`]. Dropping the receiver is the unsubscribe.

use std::fmt;

use tokio::sync::broadcast;
use tracing::warn;

use super::event::{Event, OwnerEvent};

/// Message carried by the bus.
#[derive(Debug, Clone)]
pub enum BusMessage {
    /// An aggregate event of one device.
    Event(Event),
    /// A change of an owner's device set.
    Owner(OwnerEvent),
}

impl BusMessage {
    fn topic_matches(&self, topic: &Topic) -> bool {
        match (self, topic) {
            (Self::Event(e), Topic::Device(device_id)) => e.resource_id.device_id == *device_id,
            (Self::Owner(e), Topic::Owner(owner)) => e.owner == *owner,
            _ => false,
        }
    }
}

/// Feed topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Events of every aggregate of one device.
    Device(String),
    /// Device lifecycle events of one owner.
    Owner(String),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(id) => write!(f, "device:{id}"),
            Self::Owner(owner) => write!(f, "owner:{owner}"),
        }
    }
}

/// Broadcast bus for [`BusMessage`]s.
///
/// Backed by a `tokio::broadcast` channel with a configurable capacity
/// (default 10 000). When the ring buffer is full, the oldest messages are
/// dropped for lagging receivers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusMessage>,
}

impl EventBus {
    /// Creates a new `EventBus` with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an aggregate event on its device topic.
    ///
    /// Returns the number of receivers that received the message.
    pub fn publish(&self, event: Event) -> usize {
        self.sender.send(BusMessage::Event(event)).unwrap_or(0)
    }

    /// Publishes an owner lifecycle event on its owner topic.
    pub fn publish_owner(&self, event: OwnerEvent) -> usize {
        self.sender.send(BusMessage::Owner(event)).unwrap_or(0)
    }

    /// Subscribes to one topic. Messages published before this call are not
    /// delivered.
    #[must_use]
    pub fn subscribe(&self, topic: Topic) -> FeedReceiver {
        FeedReceiver {
            topic,
            inner: self.sender.subscribe(),
        }
    }

    /// Returns the current number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving half of a topic subscription.
#[derive(Debug)]
pub struct FeedReceiver {
    topic: Topic,
    inner: broadcast::Receiver<BusMessage>,
}

impl FeedReceiver {
    /// Subscribed topic.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Waits for the next message on the topic.
    ///
    /// Lagged receivers skip the dropped messages with a warning. Returns
    /// `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.next_item().await? {
                FeedItem::Message(msg) => return Some(msg),
                FeedItem::Lagged(skipped) => {
                    warn!(topic = %self.topic, skipped, "feed receiver lagged");
                }
            }
        }
    }

    /// Waits for the next message on the topic, or reports that messages
    /// were dropped because this receiver fell behind. Returns `None` once
    /// the bus is gone.
    pub async fn next_item(&mut self) -> Option<FeedItem> {
        loop {
            match self.inner.recv().await {
                Ok(msg) if msg.topic_matches(&self.topic) => return Some(FeedItem::Message(msg)),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Some(FeedItem::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// What a [`FeedReceiver`] yields.
#[derive(Debug, Clone)]
pub enum FeedItem {
    /// A message of the subscribed topic.
    Message(BusMessage),
    /// This many bus messages, of any topic, were dropped before delivery.
    Lagged(u64),
}

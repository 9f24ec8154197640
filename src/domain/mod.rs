//! Domain layer: identifiers, events, read models and the live feed.
//!
//! This module contains the event-sourced model of devices and resources:
//! aggregate identity, the event envelope and its typed payloads, the
//! per-aggregate fold, and the topic-keyed bus that carries live events.

pub mod event;
pub mod event_bus;
pub mod event_type;
pub mod ids;
pub mod resource_model;

pub use event::{
    CommandStatus, ConnectionStatus, Content, Event, EventKind, OwnerEvent, OwnerEventKind,
    ResourceLink,
};
pub use event_bus::{BusMessage, EventBus, FeedItem, FeedReceiver, Topic};
pub use event_type::{EventFilter, EventType};
pub use ids::{AggregateKind, LINKS_HREF, ResourceId, STATUS_HREF, SubscriptionId};
pub use resource_model::{ApplyOutcome, ResourceModel};

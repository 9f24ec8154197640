//! Stream message types: client control messages and server frames.
//!
//! Every frame is a JSON object tagged by `type`:
//!
//! ```json
//! {"type":"create_subscription","token":"t1","device_id_filter":["d1"]}
//! {"type":"operation_processed","token":"t1","subscription_id":"…","status":{"code":"ok","message":""}}
//! {"type":"event","subscription_id":"…","event_type":"resource_changed","aggregate_id":"d1/light",…}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Event, EventType, OwnerEvent, SubscriptionId};
use crate::error::{GatewayError, StatusCode};
use crate::subscription::SubscriptionRequest;

/// Control messages a client sends on the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a subscription; acknowledged by `OperationProcessed` with the
    /// same token.
    CreateSubscription {
        /// Client-chosen correlation token.
        token: String,
        /// Device IDs to follow.
        #[serde(default)]
        device_id_filter: Vec<String>,
        /// Resource IDs to follow.
        #[serde(default)]
        resource_id_filter: Vec<String>,
        /// Event types of interest.
        #[serde(default)]
        event_filter: Vec<EventType>,
    },
    /// Cancel a subscription created on this stream.
    CancelSubscription {
        /// Client-chosen correlation token.
        #[serde(default)]
        token: String,
        /// Subscription to cancel.
        subscription_id: SubscriptionId,
    },
}

impl ClientMessage {
    /// Builds a create message from a request.
    #[must_use]
    pub fn create(token: impl Into<String>, request: SubscriptionRequest) -> Self {
        Self::CreateSubscription {
            token: token.into(),
            device_id_filter: request.device_id_filter,
            resource_id_filter: request.resource_id_filter,
            event_filter: request.event_filter,
        }
    }

    /// Correlation token of the message.
    #[must_use]
    pub fn token(&self) -> &str {
        match self {
            Self::CreateSubscription { token, .. } | Self::CancelSubscription { token, .. } => token,
        }
    }
}

/// Outcome carried by `OperationProcessed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    /// Status category.
    pub code: StatusCode,
    /// Human-readable message, empty on success.
    #[serde(default)]
    pub message: String,
}

impl OperationStatus {
    /// Success.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    /// Failure derived from an error.
    #[must_use]
    pub fn from_error(err: &GatewayError) -> Self {
        Self {
            code: err.status(),
            message: err.to_string(),
        }
    }

    /// Returns `true` on success.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

/// One event delivered to one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Receiving subscription.
    pub subscription_id: SubscriptionId,
    /// Command correlation ID, empty for notifications.
    #[serde(default)]
    pub correlation_id: String,
    /// Aggregate the event belongs to (`"<deviceId><href>"` or the owner).
    pub aggregate_id: String,
    /// Delivered event type.
    pub event_type: EventType,
    /// Event payload.
    pub payload: serde_json::Value,
    /// Aggregate version.
    pub version: u64,
    /// Time the store accepted the event.
    pub timestamp: DateTime<Utc>,
}

impl EventMessage {
    /// Frames an aggregate event under `event_type`.
    #[must_use]
    pub fn from_event(subscription_id: SubscriptionId, event_type: EventType, event: &Event) -> Self {
        Self {
            subscription_id,
            correlation_id: event.kind.correlation_id().unwrap_or_default().to_string(),
            aggregate_id: event.aggregate_id(),
            event_type,
            payload: serde_json::to_value(&event.kind).unwrap_or_default(),
            version: event.version,
            timestamp: event.timestamp,
        }
    }

    /// Frames an owner lifecycle event.
    #[must_use]
    pub fn from_owner_event(subscription_id: SubscriptionId, event: &OwnerEvent) -> Self {
        Self {
            subscription_id,
            correlation_id: String::new(),
            aggregate_id: event.owner.clone(),
            event_type: event.event_type(),
            payload: serde_json::to_value(&event.kind).unwrap_or_default(),
            version: event.version,
            timestamp: event.timestamp,
        }
    }
}

/// Frames the server sends on the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledges one control message.
    OperationProcessed {
        /// Token of the acknowledged message.
        token: String,
        /// Subscription the operation concerned, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subscription_id: Option<SubscriptionId>,
        /// Outcome.
        status: OperationStatus,
    },
    /// Terminal message of one subscription. Empty `reason` is a clean
    /// close; anything else names the failure.
    SubscriptionCanceled {
        /// Canceled subscription.
        subscription_id: SubscriptionId,
        /// Cancellation reason.
        #[serde(default)]
        reason: String,
    },
    /// Event delivery.
    Event(EventMessage),
}

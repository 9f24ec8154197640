//! Event envelopes flowing from the store through the projection to
//! subscribers.
//!
//! An [`Event`] advances exactly one aggregate by one version. The payload is
//! the closed sum type [`EventKind`]; owner-level device lifecycle changes
//! travel separately as [`OwnerEvent`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::event_type::EventType;
use super::ids::{AggregateKind, ResourceId};

/// Device connection status carried by metadata events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Device is connected to the gateway.
    Online,
    /// Device is disconnected.
    Offline,
}

/// Outcome reported by the device for a command or content notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Command succeeded.
    #[default]
    Ok,
    /// Resource was created.
    Created,
    /// Command accepted for asynchronous processing.
    Accepted,
    /// Request rejected by the device.
    BadRequest,
    /// Caller is not authorized on the device.
    Forbidden,
    /// Resource does not exist on the device.
    NotFound,
    /// Device was unreachable.
    Unavailable,
    /// Device does not implement the operation.
    NotImplemented,
    /// Command was canceled before the device answered.
    Canceled,
    /// Unspecified device-side failure.
    Error,
}

/// Resource representation with its media type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Content {
    /// Media type, e.g. `application/json` or `application/vnd.ocf+cbor`.
    pub content_type: String,
    /// Representation; opaque to the gateway.
    #[schema(value_type = Object)]
    pub data: serde_json::Value,
}

impl Content {
    /// JSON content.
    #[must_use]
    pub fn json(data: serde_json::Value) -> Self {
        Self {
            content_type: "application/json".to_string(),
            data,
        }
    }
}

/// A resource link published by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ResourceLink {
    /// Resource href on the device.
    pub href: String,
    /// OCF resource types (`rt`).
    #[serde(default)]
    pub resource_types: Vec<String>,
    /// OCF interfaces (`if`).
    #[serde(default)]
    pub interfaces: Vec<String>,
}

/// Payload of an aggregate event.
///
/// Pending variants open a command identified by `correlation_id`; the
/// matching completion variant closes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Device published resource links (links aggregate).
    ResourceLinksPublished {
        /// Published links.
        links: Vec<ResourceLink>,
    },
    /// Device unpublished resource links (links aggregate).
    ResourceLinksUnpublished {
        /// Unpublished hrefs.
        hrefs: Vec<String>,
    },
    /// Resource content changed.
    ResourceChanged {
        /// New representation.
        content: Content,
        /// Status reported with the notification.
        #[serde(default)]
        status: CommandStatus,
    },
    /// Create command accepted.
    ResourceCreatePending {
        /// Command correlation identifier.
        correlation_id: String,
        /// Representation to create.
        content: Content,
    },
    /// Create command completed.
    ResourceCreated {
        /// Command correlation identifier.
        correlation_id: String,
        /// Device outcome.
        status: CommandStatus,
        /// Representation returned by the device.
        #[serde(default)]
        content: Option<Content>,
    },
    /// Retrieve command accepted.
    ResourceRetrievePending {
        /// Command correlation identifier.
        correlation_id: String,
        /// Requested interface.
        #[serde(default)]
        interface: Option<String>,
    },
    /// Retrieve command completed.
    ResourceRetrieved {
        /// Command correlation identifier.
        correlation_id: String,
        /// Device outcome.
        status: CommandStatus,
        /// Representation returned by the device.
        #[serde(default)]
        content: Option<Content>,
    },
    /// Update command accepted.
    ResourceUpdatePending {
        /// Command correlation identifier.
        correlation_id: String,
        /// Requested representation.
        content: Content,
    },
    /// Update command completed.
    ResourceUpdated {
        /// Command correlation identifier.
        correlation_id: String,
        /// Device outcome.
        status: CommandStatus,
        /// Representation returned by the device.
        #[serde(default)]
        content: Option<Content>,
    },
    /// Delete command accepted.
    ResourceDeletePending {
        /// Command correlation identifier.
        correlation_id: String,
    },
    /// Delete command completed.
    ResourceDeleted {
        /// Command correlation identifier.
        correlation_id: String,
        /// Device outcome.
        status: CommandStatus,
        /// Representation returned by the device.
        #[serde(default)]
        content: Option<Content>,
    },
    /// Device metadata update accepted (status aggregate).
    DeviceMetadataUpdatePending {
        /// Command correlation identifier.
        correlation_id: String,
        /// Requested twin synchronisation state.
        twin_enabled: bool,
    },
    /// Device metadata changed (status aggregate).
    DeviceMetadataUpdated {
        /// Connection status after the change.
        connection: ConnectionStatus,
        /// Twin synchronisation state after the change.
        #[serde(default = "default_twin_enabled")]
        twin_enabled: bool,
        /// Set when the change completes a pending metadata command.
        #[serde(default)]
        correlation_id: Option<String>,
        /// Outcome of the completed command, if any.
        #[serde(default)]
        status: CommandStatus,
    },
}

const fn default_twin_enabled() -> bool {
    true
}

impl EventKind {
    /// Primary event type of this payload.
    ///
    /// `device_online`/`device_offline` are never returned here; they are
    /// derived from `DeviceMetadataUpdated` by comparing connection status.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::ResourceLinksPublished { .. } => EventType::ResourcePublished,
            Self::ResourceLinksUnpublished { .. } => EventType::ResourceUnpublished,
            Self::ResourceChanged { .. } => EventType::ResourceChanged,
            Self::ResourceCreatePending { .. } => EventType::ResourceCreatePending,
            Self::ResourceCreated { .. } => EventType::ResourceCreated,
            Self::ResourceRetrievePending { .. } => EventType::ResourceRetrievePending,
            Self::ResourceRetrieved { .. } => EventType::ResourceRetrieved,
            Self::ResourceUpdatePending { .. } => EventType::ResourceUpdatePending,
            Self::ResourceUpdated { .. } => EventType::ResourceUpdated,
            Self::ResourceDeletePending { .. } => EventType::ResourceDeletePending,
            Self::ResourceDeleted { .. } => EventType::ResourceDeleted,
            Self::DeviceMetadataUpdatePending { .. } => EventType::DeviceMetadataUpdatePending,
            Self::DeviceMetadataUpdated { .. } => EventType::DeviceMetadataUpdated,
        }
    }

    /// Kind of aggregate this payload may be appended to.
    #[must_use]
    pub const fn aggregate_kind(&self) -> AggregateKind {
        match self {
            Self::ResourceLinksPublished { .. } | Self::ResourceLinksUnpublished { .. } => {
                AggregateKind::Links
            }
            Self::DeviceMetadataUpdatePending { .. } | Self::DeviceMetadataUpdated { .. } => {
                AggregateKind::Status
            }
            _ => AggregateKind::Resource,
        }
    }

    /// Correlation ID of a command event, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::ResourceCreatePending { correlation_id, .. }
            | Self::ResourceCreated { correlation_id, .. }
            | Self::ResourceRetrievePending { correlation_id, .. }
            | Self::ResourceRetrieved { correlation_id, .. }
            | Self::ResourceUpdatePending { correlation_id, .. }
            | Self::ResourceUpdated { correlation_id, .. }
            | Self::ResourceDeletePending { correlation_id, .. }
            | Self::ResourceDeleted { correlation_id, .. }
            | Self::DeviceMetadataUpdatePending { correlation_id, .. } => Some(correlation_id),
            Self::DeviceMetadataUpdated { correlation_id, .. } => correlation_id.as_deref(),
            _ => None,
        }
    }

    /// Returns `true` for variants that open a pending command.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::ResourceCreatePending { .. }
                | Self::ResourceRetrievePending { .. }
                | Self::ResourceUpdatePending { .. }
                | Self::ResourceDeletePending { .. }
                | Self::DeviceMetadataUpdatePending { .. }
        )
    }

    /// Returns `true` for variants that may close a pending command.
    #[must_use]
    pub const fn is_completion(&self) -> bool {
        matches!(
            self,
            Self::ResourceCreated { .. }
                | Self::ResourceRetrieved { .. }
                | Self::ResourceUpdated { .. }
                | Self::ResourceDeleted { .. }
                | Self::DeviceMetadataUpdated { .. }
        )
    }

    /// Completion that closes this resource command with
    /// [`CommandStatus::Canceled`].
    ///
    /// Returns `None` for non-pending variants and for metadata commands,
    /// whose completion depends on the current device status.
    #[must_use]
    pub fn canceled_completion(&self) -> Option<Self> {
        let correlation_id = self.correlation_id()?.to_string();
        let status = CommandStatus::Canceled;
        match self {
            Self::ResourceCreatePending { .. } => Some(Self::ResourceCreated {
                correlation_id,
                status,
                content: None,
            }),
            Self::ResourceRetrievePending { .. } => Some(Self::ResourceRetrieved {
                correlation_id,
                status,
                content: None,
            }),
            Self::ResourceUpdatePending { .. } => Some(Self::ResourceUpdated {
                correlation_id,
                status,
                content: None,
            }),
            Self::ResourceDeletePending { .. } => Some(Self::ResourceDeleted {
                correlation_id,
                status,
                content: None,
            }),
            _ => None,
        }
    }
}

/// One versioned event of one aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Aggregate the event belongs to.
    pub resource_id: ResourceId,
    /// Per-aggregate sequence number, starting at 1.
    pub version: u64,
    /// Time the store accepted the event.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub kind: EventKind,
}

impl Event {
    /// Primary event type of the payload.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    /// Aggregate identifier (dedup key prefix).
    #[must_use]
    pub fn aggregate_id(&self) -> String {
        self.resource_id.aggregate_id()
    }

    /// Device the event belongs to.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.resource_id.device_id
    }
}

/// Owner-level lifecycle payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OwnerEventKind {
    /// Devices were registered to the owner.
    DevicesRegistered {
        /// Added device IDs.
        device_ids: Vec<String>,
    },
    /// Devices were unregistered from the owner.
    DevicesUnregistered {
        /// Removed device IDs.
        device_ids: Vec<String>,
    },
}

/// Change of the device set of one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerEvent {
    /// Owner whose device set changed.
    pub owner: String,
    /// Per-owner sequence number.
    pub version: u64,
    /// Time of the change.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub kind: OwnerEventKind,
}

impl OwnerEvent {
    /// Event type used for filtering.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self.kind {
            OwnerEventKind::DevicesRegistered { .. } => EventType::DeviceRegistered,
            OwnerEventKind::DevicesUnregistered { .. } => EventType::DeviceUnregistered,
        }
    }

    /// Device IDs touched by the change.
    #[must_use]
    pub fn device_ids(&self) -> &[String] {
        match &self.kind {
            OwnerEventKind::DevicesRegistered { device_ids }
            | OwnerEventKind::DevicesUnregistered { device_ids } => device_ids,
        }
    }
}

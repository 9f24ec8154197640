//! Ingestion DTOs: appended events, ownership changes, command cancellation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::{Event, EventKind, EventType, OwnerEvent};

/// Request body for `POST /api/v1/events`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct AppendEventRequest {
    /// Target aggregate, `"<deviceId><href>"`.
    pub resource_id: String,
    /// Event payload; its `type` tag selects the event kind.
    pub event: EventKind,
}

/// One stored event as returned by the ingestion routes.
#[derive(Debug, Serialize, ToSchema)]
pub struct EventDto {
    /// Aggregate identifier.
    pub aggregate_id: String,
    /// Event type.
    pub event_type: EventType,
    /// Version assigned by the store.
    pub version: u64,
    /// Time the store accepted the event.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    pub event: EventKind,
}

impl From<Event> for EventDto {
    fn from(event: Event) -> Self {
        Self {
            aggregate_id: event.aggregate_id(),
            event_type: event.event_type(),
            version: event.version,
            timestamp: event.timestamp,
            event: event.kind,
        }
    }
}

/// Response body for the device ownership routes.
#[derive(Debug, Serialize, ToSchema)]
pub struct OwnershipResponse {
    /// Owner.
    pub owner: String,
    /// Device.
    pub device_id: String,
    /// `false` when the request changed nothing.
    pub changed: bool,
    /// Owner sequence number of the published lifecycle event.
    pub version: Option<u64>,
}

impl OwnershipResponse {
    /// Builds the response from an optional lifecycle event.
    #[must_use]
    pub fn new(owner: String, device_id: String, event: Option<&OwnerEvent>) -> Self {
        Self {
            owner,
            device_id,
            changed: event.is_some(),
            version: event.map(|e| e.version),
        }
    }
}

/// Request body for `POST /api/v1/pending-commands/cancel`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CancelPendingRequest {
    /// Aggregate holding the commands.
    pub resource_id: String,
    /// Correlation IDs to cancel; empty cancels every open command.
    #[serde(default)]
    pub correlation_ids: Vec<String>,
}

/// Response body for `POST /api/v1/pending-commands/cancel`.
#[derive(Debug, Serialize, ToSchema)]
pub struct CancelPendingResponse {
    /// Completion events appended for the canceled commands.
    pub canceled: Vec<EventDto>,
}

//! Database rows for events and ownership.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Event, EventKind, OwnerEvent, OwnerEventKind, ResourceId};
use crate::error::GatewayError;

/// A stored event row from the `events` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredEvent {
    /// Owning device.
    pub device_id: String,
    /// Aggregate href.
    pub href: String,
    /// Per-aggregate version.
    pub version: i64,
    /// Event type discriminator (e.g. `"resource_changed"`).
    pub event_type: String,
    /// JSONB payload, the serialized [`EventKind`].
    pub payload: serde_json::Value,
    /// Server-side creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Decodes the row into a domain event.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] if the payload or version
    /// is corrupt.
    pub fn into_event(self) -> Result<Event, GatewayError> {
        let kind: EventKind = serde_json::from_value(self.payload).map_err(|e| {
            GatewayError::PersistenceError(format!("corrupt event payload: {e}"))
        })?;
        Ok(Event {
            resource_id: ResourceId::new(self.device_id, self.href),
            version: decode_version(self.version)?,
            timestamp: self.created_at,
            kind,
        })
    }
}

/// A stored row from the `owner_events` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredOwnerEvent {
    /// Owner whose device set changed.
    pub owner: String,
    /// Per-owner version.
    pub version: i64,
    /// JSONB payload, the serialized [`OwnerEventKind`].
    pub payload: serde_json::Value,
    /// Server-side creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl StoredOwnerEvent {
    /// Decodes the row into a domain owner event.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] if the payload or version
    /// is corrupt.
    pub fn into_owner_event(self) -> Result<OwnerEvent, GatewayError> {
        let kind: OwnerEventKind = serde_json::from_value(self.payload).map_err(|e| {
            GatewayError::PersistenceError(format!("corrupt owner event payload: {e}"))
        })?;
        Ok(OwnerEvent {
            owner: self.owner,
            version: decode_version(self.version)?,
            timestamp: self.created_at,
            kind,
        })
    }
}

fn decode_version(version: i64) -> Result<u64, GatewayError> {
    u64::try_from(version)
        .map_err(|_| GatewayError::PersistenceError(format!("negative version {version}")))
}

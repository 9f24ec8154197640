//! Persistence layer: the append-only event store behind the projection.
//!
//! [`EventStore`] is the contract the projection and the ingestion service
//! have with storage: append one event to an aggregate, query the events of
//! a device for a snapshot, and maintain which devices belong to which
//! owner. [`MemoryEventStore`] backs tests and single-node runs;
//! [`PostgresEventStore`] is the durable adapter.

pub mod memory;
pub mod models;
pub mod postgres;

use std::fmt;

use async_trait::async_trait;

use crate::domain::{Event, EventKind, OwnerEvent, ResourceId};
use crate::error::GatewayError;

pub use memory::MemoryEventStore;
pub use postgres::PostgresEventStore;

/// Snapshot query: every aggregate of a device, or a single one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotQuery {
    /// Device whose aggregates are loaded.
    pub device_id: String,
    /// Restrict to one href.
    pub href: Option<String>,
}

impl SnapshotQuery {
    /// Every aggregate of `device_id`.
    #[must_use]
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            href: None,
        }
    }

    /// A single aggregate.
    #[must_use]
    pub fn resource(resource_id: &ResourceId) -> Self {
        Self {
            device_id: resource_id.device_id.clone(),
            href: Some(resource_id.href.clone()),
        }
    }
}

/// Device set of one owner as of a given owner event version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnerDevices {
    /// Version of the last ownership change reflected in `device_ids`.
    pub version: u64,
    /// Registered devices, sorted.
    pub device_ids: Vec<String>,
}

/// Append-only, per-aggregate ordered event log.
#[async_trait]
pub trait EventStore: Send + Sync + fmt::Debug {
    /// Appends `kind` to the aggregate, assigning the next version.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UpstreamUnavailable`] when the store cannot
    /// be reached and [`GatewayError::VersionConflict`] when concurrent
    /// writers keep racing on the same aggregate.
    async fn append(&self, resource_id: &ResourceId, kind: EventKind)
    -> Result<Event, GatewayError>;

    /// Loads matching events ordered by aggregate, then version.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UpstreamUnavailable`] when the store cannot
    /// be reached.
    async fn load(&self, query: &SnapshotQuery) -> Result<Vec<Event>, GatewayError>;

    /// Devices currently registered to `owner`, with the version of the
    /// last ownership change they reflect.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UpstreamUnavailable`] when the store cannot
    /// be reached.
    async fn owner_devices(&self, owner: &str) -> Result<OwnerDevices, GatewayError>;

    /// Adds `device_id` to `owner`. Returns `None` if it was already there.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UpstreamUnavailable`] when the store cannot
    /// be reached.
    async fn register_device(
        &self,
        owner: &str,
        device_id: &str,
    ) -> Result<Option<OwnerEvent>, GatewayError>;

    /// Removes `device_id` from `owner`. Returns `None` if it was not there.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UpstreamUnavailable`] when the store cannot
    /// be reached.
    async fn unregister_device(
        &self,
        owner: &str,
        device_id: &str,
    ) -> Result<Option<OwnerEvent>, GatewayError>;
}

//! Event service: accepts events for aggregates, stores them, and puts them
//! on the live feed.

use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{Event, EventBus, EventKind, OwnerEvent, ResourceId, ResourceModel};
use crate::error::GatewayError;
use crate::persistence::{EventStore, SnapshotQuery};

/// Write side of the gateway.
///
/// Every mutation follows the same pattern: append to the store, which
/// assigns the version, then publish the stored event on the bus so the
/// projection and every live subscription observe it.
#[derive(Debug, Clone)]
pub struct EventService {
    store: Arc<dyn EventStore>,
    bus: EventBus,
}

impl EventService {
    /// Creates a new `EventService`.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Appends `kind` to the aggregate and publishes the stored event.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] when the event does not
    /// belong to the kind of aggregate `resource_id` names, and any store
    /// error otherwise.
    pub async fn append(
        &self,
        resource_id: &ResourceId,
        kind: EventKind,
    ) -> Result<Event, GatewayError> {
        if kind.aggregate_kind() != resource_id.kind() {
            return Err(GatewayError::InvalidRequest(format!(
                "{} events cannot be appended to {resource_id}",
                kind.event_type()
            )));
        }
        let event = self.store.append(resource_id, kind).await?;
        let receivers = self.bus.publish(event.clone());
        debug!(
            aggregate_id = %event.aggregate_id(),
            version = event.version,
            event_type = %event.event_type(),
            receivers,
            "event appended"
        );
        Ok(event)
    }

    /// Registers `device_id` to `owner`.
    ///
    /// Returns the published lifecycle event, or `None` when the device was
    /// already registered to the owner.
    ///
    /// # Errors
    ///
    /// Returns any store error.
    pub async fn register_device(
        &self,
        owner: &str,
        device_id: &str,
    ) -> Result<Option<OwnerEvent>, GatewayError> {
        let event = self.store.register_device(owner, device_id).await?;
        if let Some(event) = &event {
            self.bus.publish_owner(event.clone());
            info!(%owner, %device_id, "device registered");
        }
        Ok(event)
    }

    /// Removes `device_id` from `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] when the device is not registered
    /// to the owner, and any store error otherwise.
    pub async fn unregister_device(
        &self,
        owner: &str,
        device_id: &str,
    ) -> Result<OwnerEvent, GatewayError> {
        let Some(event) = self.store.unregister_device(owner, device_id).await? else {
            return Err(GatewayError::NotFound(format!(
                "device {device_id} of owner {owner}"
            )));
        };
        self.bus.publish_owner(event.clone());
        info!(%owner, %device_id, "device unregistered");
        Ok(event)
    }

    /// Cancels open commands on an aggregate by correlation ID.
    ///
    /// Folds the aggregate from the store and appends a canceled completion
    /// for every matching pending command. An empty filter cancels every
    /// open command.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] when a non-empty filter matches no
    /// open command, and any store error otherwise.
    pub async fn cancel_pending_commands(
        &self,
        resource_id: &ResourceId,
        correlation_ids: &[String],
    ) -> Result<Vec<Event>, GatewayError> {
        let history = self.store.load(&SnapshotQuery::resource(resource_id)).await?;
        let mut model = ResourceModel::new(resource_id.clone());
        for event in &history {
            model.apply(event);
        }

        let completions = model.cancel_pending(correlation_ids);
        if completions.is_empty() && !correlation_ids.is_empty() {
            return Err(GatewayError::NotFound(format!(
                "no pending command of {resource_id} matches {}",
                correlation_ids.join(", ")
            )));
        }

        let mut canceled = Vec::with_capacity(completions.len());
        for kind in completions {
            canceled.push(self.append(resource_id, kind).await?);
        }
        info!(%resource_id, canceled = canceled.len(), "pending commands canceled");
        Ok(canceled)
    }
}

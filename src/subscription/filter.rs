//! Subscription variants, capability sets and event routing.
//!
//! The variant is chosen once from the request: a resource ID filter makes
//! a resource-content subscription, otherwise a device ID filter makes a
//! device subscription, otherwise the subscription spans every device of
//! the owner. Each variant supports a fixed set of event types; the
//! effective filter is the requested set intersected with it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::{ConnectionStatus, Event, EventFilter, EventKind, EventType, ResourceId};
use crate::error::GatewayError;

/// What a client asks for when creating a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionRequest {
    /// Device IDs to follow.
    #[serde(default)]
    pub device_id_filter: Vec<String>,
    /// Resource IDs (`"<deviceId><href>"`) to follow.
    #[serde(default)]
    pub resource_id_filter: Vec<String>,
    /// Event types of interest; empty means every type the variant supports.
    #[serde(default)]
    pub event_filter: Vec<EventType>,
}

/// Subscription variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Every device of the owner, device-level events only.
    DevicesWide,
    /// Selected devices, all resource and device events.
    Device {
        /// Requested devices.
        device_ids: BTreeSet<String>,
    },
    /// Selected resources, content and command events.
    Resource {
        /// Requested resources.
        resource_ids: BTreeSet<ResourceId>,
    },
}

impl SubscriptionKind {
    /// Event types this variant can deliver.
    #[must_use]
    pub fn supported(&self) -> EventFilter {
        let resource = EventFilter::from_types([EventType::ResourceChanged])
            .union(EventFilter::RESOURCE_PENDING)
            .union(EventFilter::RESOURCE_COMPLETED);
        match self {
            Self::Resource { .. } => resource,
            Self::Device { .. } => resource
                .union(EventFilter::from_types([
                    EventType::ResourcePublished,
                    EventType::ResourceUnpublished,
                ]))
                .union(EventFilter::DEVICE_METADATA),
            Self::DevicesWide => EventFilter::from_types([
                EventType::DeviceRegistered,
                EventType::DeviceUnregistered,
                EventType::DeviceOnline,
                EventType::DeviceOffline,
            ])
            .union(EventFilter::DEVICE_METADATA),
        }
    }

    /// Short variant name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DevicesWide => "devices",
            Self::Device { .. } => "device",
            Self::Resource { .. } => "resource",
        }
    }
}

/// Validated variant plus effective event filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    kind: SubscriptionKind,
    events: EventFilter,
}

impl SubscriptionFilter {
    /// Validates a request. Performs no side effects.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidRequest`] for a malformed resource ID
    /// and [`GatewayError::InvalidSubscription`] when no requested event
    /// type is supported by the selected variant.
    pub fn from_request(request: &SubscriptionRequest) -> Result<Self, GatewayError> {
        let kind = if !request.resource_id_filter.is_empty() {
            let resource_ids = request
                .resource_id_filter
                .iter()
                .map(|id| id.parse::<ResourceId>())
                .collect::<Result<BTreeSet<_>, _>>()?;
            SubscriptionKind::Resource { resource_ids }
        } else if !request.device_id_filter.is_empty() {
            SubscriptionKind::Device {
                device_ids: request.device_id_filter.iter().cloned().collect(),
            }
        } else {
            SubscriptionKind::DevicesWide
        };

        let supported = kind.supported();
        let events = EventFilter::from_request(&request.event_filter, supported).intersection(supported);
        if events.is_empty() {
            return Err(GatewayError::InvalidSubscription(format!(
                "none of the requested event types is supported by a {} subscription",
                kind.name()
            )));
        }
        Ok(Self { kind, events })
    }

    /// Variant.
    #[must_use]
    pub const fn kind(&self) -> &SubscriptionKind {
        &self.kind
    }

    /// Effective event filter; also the capability set of the subscription.
    #[must_use]
    pub const fn events(&self) -> EventFilter {
        self.events
    }

    /// Returns `true` if a device-set change of the owner concerns this
    /// subscription.
    #[must_use]
    pub fn wants_device(&self, device_id: &str) -> bool {
        match &self.kind {
            SubscriptionKind::DevicesWide => true,
            SubscriptionKind::Device { device_ids } => device_ids.contains(device_id),
            SubscriptionKind::Resource { resource_ids } => {
                resource_ids.iter().any(|r| r.device_id == device_id)
            }
        }
    }

    /// Returns `true` if the subscription loses meaning once it follows no
    /// device.
    #[must_use]
    pub const fn is_scoped(&self) -> bool {
        !matches!(self.kind, SubscriptionKind::DevicesWide)
    }

    /// Devices to follow, restricted to those the owner holds.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] when a scoped subscription keeps
    /// no device after owner scoping.
    pub fn devices_of_interest(
        &self,
        owner_devices: &[String],
    ) -> Result<BTreeSet<String>, GatewayError> {
        let devices: BTreeSet<String> = owner_devices
            .iter()
            .filter(|d| self.wants_device(d))
            .cloned()
            .collect();
        if devices.is_empty() && self.is_scoped() {
            return Err(GatewayError::NotFound(
                "no requested device is registered to the owner".to_string(),
            ));
        }
        Ok(devices)
    }

    /// Returns `true` if events of `resource_id` may be delivered.
    #[must_use]
    pub fn matches_resource(&self, resource_id: &ResourceId) -> bool {
        match &self.kind {
            SubscriptionKind::Resource { resource_ids } => resource_ids.contains(resource_id),
            SubscriptionKind::DevicesWide | SubscriptionKind::Device { .. } => true,
        }
    }

    /// Event types under which `event` is delivered.
    ///
    /// `previous` is the last connection status this subscription observed
    /// for the device; a metadata update that changes it also yields
    /// `device_online` or `device_offline`.
    #[must_use]
    pub fn route(&self, event: &Event, previous: Option<ConnectionStatus>) -> Vec<EventType> {
        if !self.matches_resource(&event.resource_id) {
            return Vec::new();
        }
        let mut types = Vec::with_capacity(2);
        let primary = event.event_type();
        if self.events.contains(primary) {
            types.push(primary);
        }
        if let EventKind::DeviceMetadataUpdated { connection, .. } = &event.kind
            && previous != Some(*connection)
        {
            let derived = connection_event_type(*connection);
            if self.events.contains(derived) {
                types.push(derived);
            }
        }
        types
    }
}

/// Event type derived from a connection status.
#[must_use]
pub const fn connection_event_type(status: ConnectionStatus) -> EventType {
    match status {
        ConnectionStatus::Online => EventType::DeviceOnline,
        ConnectionStatus::Offline => EventType::DeviceOffline,
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::CommandStatus;
    use chrono::Utc;

    fn request(devices: &[&str], resources: &[&str], events: &[EventType]) -> SubscriptionRequest {
        SubscriptionRequest {
            device_id_filter: devices.iter().map(|d| (*d).to_string()).collect(),
            resource_id_filter: resources.iter().map(|r| (*r).to_string()).collect(),
            event_filter: events.to_vec(),
        }
    }

    fn metadata(connection: ConnectionStatus) -> Event {
        Event {
            resource_id: ResourceId::status("d"),
            version: 2,
            timestamp: Utc::now(),
            kind: EventKind::DeviceMetadataUpdated {
                connection,
                twin_enabled: true,
                correlation_id: None,
                status: CommandStatus::Ok,
            },
        }
    }

    #[test]
    fn variant_selection_prefers_resource_filter() {
        let Ok(filter) = SubscriptionFilter::from_request(&request(&["d"], &["d/light"], &[]))
        else {
            panic!("valid request");
        };
        assert!(matches!(filter.kind(), SubscriptionKind::Resource { .. }));

        let Ok(filter) = SubscriptionFilter::from_request(&request(&["d"], &[], &[])) else {
            panic!("valid request");
        };
        assert!(matches!(filter.kind(), SubscriptionKind::Device { .. }));

        let Ok(filter) = SubscriptionFilter::from_request(&request(&[], &[], &[])) else {
            panic!("valid request");
        };
        assert_eq!(filter.kind(), &SubscriptionKind::DevicesWide);
    }

    #[test]
    fn empty_event_filter_means_full_capability_set() {
        let Ok(filter) = SubscriptionFilter::from_request(&request(&["d"], &[], &[])) else {
            panic!("valid request");
        };
        assert_eq!(filter.events(), filter.kind().supported());
    }

    #[test]
    fn unsupported_filter_is_rejected() {
        let result = SubscriptionFilter::from_request(&request(
            &[],
            &["d/light"],
            &[EventType::DeviceOnline],
        ));
        assert!(matches!(result, Err(GatewayError::InvalidSubscription(_))));
    }

    #[test]
    fn malformed_resource_id_is_invalid_request() {
        let result = SubscriptionFilter::from_request(&request(&[], &["light"], &[]));
        assert!(matches!(result, Err(GatewayError::InvalidRequest(_))));
    }

    #[test]
    fn owner_scoping_drops_foreign_devices() {
        let Ok(filter) = SubscriptionFilter::from_request(&request(&["a", "b"], &[], &[])) else {
            panic!("valid request");
        };
        let Ok(devices) = filter.devices_of_interest(&["b".to_string(), "c".to_string()]) else {
            panic!("b is owned");
        };
        assert_eq!(devices.into_iter().collect::<Vec<_>>(), vec!["b".to_string()]);
        assert!(matches!(
            filter.devices_of_interest(&["c".to_string()]),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn devices_wide_may_start_empty() {
        let Ok(filter) = SubscriptionFilter::from_request(&request(&[], &[], &[])) else {
            panic!("valid request");
        };
        assert!(matches!(filter.devices_of_interest(&[]), Ok(d) if d.is_empty()));
    }

    #[test]
    fn connection_change_derives_online_offline() {
        let Ok(filter) = SubscriptionFilter::from_request(&request(
            &[],
            &[],
            &[EventType::DeviceOnline, EventType::DeviceOffline],
        )) else {
            panic!("valid request");
        };
        let online = metadata(ConnectionStatus::Online);
        assert_eq!(filter.route(&online, None), vec![EventType::DeviceOnline]);
        assert!(filter.route(&online, Some(ConnectionStatus::Online)).is_empty());
        assert_eq!(
            filter.route(&metadata(ConnectionStatus::Offline), Some(ConnectionStatus::Online)),
            vec![EventType::DeviceOffline]
        );
    }

    #[test]
    fn resource_variant_ignores_other_resources() {
        let Ok(filter) = SubscriptionFilter::from_request(&request(&[], &["d/light"], &[])) else {
            panic!("valid request");
        };
        let event = Event {
            resource_id: ResourceId::new("d", "/fan"),
            version: 1,
            timestamp: Utc::now(),
            kind: EventKind::ResourceDeletePending {
                correlation_id: "c".into(),
            },
        };
        assert!(filter.route(&event, None).is_empty());
    }
}

//! Event type discriminators and the filter bitmask built from them.

use std::fmt;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Every event type a subscriber can declare interest in.
///
/// `DeviceOnline`/`DeviceOffline` are derived from `DeviceMetadataUpdated`
/// events whose connection status changed; `DeviceRegistered`/
/// `DeviceUnregistered` come from the owner lifecycle topic. All other
/// variants correspond one-to-one to an [`super::EventKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Resource create command accepted, awaiting the device.
    ResourceCreatePending,
    /// Resource create command completed.
    ResourceCreated,
    /// Resource retrieve command accepted, awaiting the device.
    ResourceRetrievePending,
    /// Resource retrieve command completed.
    ResourceRetrieved,
    /// Resource update command accepted, awaiting the device.
    ResourceUpdatePending,
    /// Resource update command completed.
    ResourceUpdated,
    /// Resource delete command accepted, awaiting the device.
    ResourceDeletePending,
    /// Resource delete command completed.
    ResourceDeleted,
    /// Device metadata update accepted, awaiting the device.
    DeviceMetadataUpdatePending,
    /// Device metadata (connection status, twin flag) changed.
    DeviceMetadataUpdated,
    /// Devices were added to the owner.
    DeviceRegistered,
    /// Devices were removed from the owner.
    DeviceUnregistered,
    /// Resource content changed.
    ResourceChanged,
    /// Resource links were published by the device.
    ResourcePublished,
    /// Resource links were unpublished by the device.
    ResourceUnpublished,
    /// Device connection went online.
    DeviceOnline,
    /// Device connection went offline.
    DeviceOffline,
}

impl EventType {
    /// All event types, in bit order.
    pub const ALL: [Self; 17] = [
        Self::ResourceCreatePending,
        Self::ResourceCreated,
        Self::ResourceRetrievePending,
        Self::ResourceRetrieved,
        Self::ResourceUpdatePending,
        Self::ResourceUpdated,
        Self::ResourceDeletePending,
        Self::ResourceDeleted,
        Self::DeviceMetadataUpdatePending,
        Self::DeviceMetadataUpdated,
        Self::DeviceRegistered,
        Self::DeviceUnregistered,
        Self::ResourceChanged,
        Self::ResourcePublished,
        Self::ResourceUnpublished,
        Self::DeviceOnline,
        Self::DeviceOffline,
    ];

    /// Bit of this type inside an [`EventFilter`].
    #[must_use]
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// Returns the event type as a static string slice.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResourceCreatePending => "resource_create_pending",
            Self::ResourceCreated => "resource_created",
            Self::ResourceRetrievePending => "resource_retrieve_pending",
            Self::ResourceRetrieved => "resource_retrieved",
            Self::ResourceUpdatePending => "resource_update_pending",
            Self::ResourceUpdated => "resource_updated",
            Self::ResourceDeletePending => "resource_delete_pending",
            Self::ResourceDeleted => "resource_deleted",
            Self::DeviceMetadataUpdatePending => "device_metadata_update_pending",
            Self::DeviceMetadataUpdated => "device_metadata_updated",
            Self::DeviceRegistered => "device_registered",
            Self::DeviceUnregistered => "device_unregistered",
            Self::ResourceChanged => "resource_changed",
            Self::ResourcePublished => "resource_published",
            Self::ResourceUnpublished => "resource_unpublished",
            Self::DeviceOnline => "device_online",
            Self::DeviceOffline => "device_offline",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of [`EventType`]s stored as a bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventFilter(u32);

impl EventFilter {
    /// Filter that matches nothing.
    pub const EMPTY: Self = Self(0);

    /// Pending command types of resources.
    pub const RESOURCE_PENDING: Self = Self(
        EventType::ResourceCreatePending.bit()
            | EventType::ResourceRetrievePending.bit()
            | EventType::ResourceUpdatePending.bit()
            | EventType::ResourceDeletePending.bit(),
    );

    /// Completed command types of resources.
    pub const RESOURCE_COMPLETED: Self = Self(
        EventType::ResourceCreated.bit()
            | EventType::ResourceRetrieved.bit()
            | EventType::ResourceUpdated.bit()
            | EventType::ResourceDeleted.bit(),
    );

    /// Device metadata types.
    pub const DEVICE_METADATA: Self = Self(
        EventType::DeviceMetadataUpdatePending.bit() | EventType::DeviceMetadataUpdated.bit(),
    );

    /// Filter that matches every type.
    #[must_use]
    pub fn all() -> Self {
        Self::from_types(EventType::ALL)
    }

    /// Builds a filter from an explicit list of types.
    #[must_use]
    pub fn from_types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self(types.into_iter().fold(0, |acc, t| acc | t.bit()))
    }

    /// Builds a filter from a client request: an empty list means `default`.
    #[must_use]
    pub fn from_request(types: &[EventType], default: Self) -> Self {
        if types.is_empty() {
            default
        } else {
            Self::from_types(types.iter().copied())
        }
    }

    /// Returns `true` if `event_type` is in the set.
    #[must_use]
    pub const fn contains(self, event_type: EventType) -> bool {
        self.0 & event_type.bit() != 0
    }

    /// Returns `true` if any type of `other` is in the set.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Set intersection.
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Set union.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `true` if the set is empty.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates over the contained types in bit order.
    pub fn iter(self) -> impl Iterator<Item = EventType> {
        EventType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl FromIterator<EventType> for EventFilter {
    fn from_iter<I: IntoIterator<Item = EventType>>(iter: I) -> Self {
        Self::from_types(iter)
    }
}

//! Type-safe identifiers for aggregates and subscriptions.
//!
//! [`ResourceId`] names one event-sourced aggregate: a device resource, or one
//! of the two per-device aggregates that hold connection status and the
//! published resource links. [`SubscriptionId`] is a newtype wrapper around
//! [`uuid::Uuid`] (v4) so subscription identifiers cannot be confused with
//! other UUIDs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Reserved href of the per-device connection status aggregate.
pub const STATUS_HREF: &str = "/device-status";

/// Reserved href of the per-device resource links aggregate.
pub const LINKS_HREF: &str = "/device-links";

/// Which kind of aggregate a [`ResourceId`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    /// Device connection status and metadata.
    Status,
    /// Set of resource links the device has published.
    Links,
    /// Content and commands of a single device resource.
    Resource,
}

/// Identity of one aggregate: `(device_id, href)`.
///
/// The wire form is `"<device_id><href>"`; hrefs always start with `/`, so
/// parsing splits at the first slash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    /// Owning device.
    pub device_id: String,
    /// Resource href on the device, or one of the reserved hrefs.
    pub href: String,
}

impl ResourceId {
    /// Creates a resource ID, normalising the href to start with `/`.
    #[must_use]
    pub fn new(device_id: impl Into<String>, href: impl Into<String>) -> Self {
        let href = href.into();
        let href = if href.starts_with('/') {
            href
        } else {
            format!("/{href}")
        };
        Self {
            device_id: device_id.into(),
            href,
        }
    }

    /// Connection status aggregate of `device_id`.
    #[must_use]
    pub fn status(device_id: impl Into<String>) -> Self {
        Self::new(device_id, STATUS_HREF)
    }

    /// Resource links aggregate of `device_id`.
    #[must_use]
    pub fn links(device_id: impl Into<String>) -> Self {
        Self::new(device_id, LINKS_HREF)
    }

    /// Returns the aggregate kind derived from the href.
    #[must_use]
    pub fn kind(&self) -> AggregateKind {
        match self.href.as_str() {
            STATUS_HREF => AggregateKind::Status,
            LINKS_HREF => AggregateKind::Links,
            _ => AggregateKind::Resource,
        }
    }

    /// Stable aggregate identifier used as the dedup and storage key.
    #[must_use]
    pub fn aggregate_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.device_id, self.href)
    }
}

impl FromStr for ResourceId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(split) = s.find('/') else {
            return Err(GatewayError::InvalidRequest(format!(
                "invalid resource id '{s}': expected <deviceId>/<href>"
            )));
        };
        let (device_id, href) = s.split_at(split);
        if device_id.is_empty() || href.len() < 2 {
            return Err(GatewayError::InvalidRequest(format!(
                "invalid resource id '{s}': empty device id or href"
            )));
        }
        Ok(Self::new(device_id, href))
    }
}

/// Server-assigned identifier of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(uuid::Uuid);

impl SubscriptionId {
    /// Creates a new random `SubscriptionId` (UUID v4).
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Creates a `SubscriptionId` from an existing [`uuid::Uuid`].
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner [`uuid::Uuid`].
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<uuid::Uuid> for SubscriptionId {
    fn from(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }
}

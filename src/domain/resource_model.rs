//! Read model of a single aggregate, built by folding its events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::event::{CommandStatus, ConnectionStatus, Event, EventKind, ResourceLink};
use super::ids::{AggregateKind, ResourceId};

/// Result of folding one event into a [`ResourceModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Event advanced the model.
    Applied {
        /// Set when the event changed the device connection status.
        connection_changed: Option<ConnectionStatus>,
    },
    /// Event version was not newer than the model; nothing changed.
    Stale {
        /// Version the model already holds.
        current: u64,
    },
}

/// Latest known state of one aggregate.
///
/// Mutated only through [`ResourceModel::apply`], one event at a time in
/// increasing version order. Callers outside the projection only ever see
/// clones.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceModel {
    resource_id: ResourceId,
    version: u64,
    updated_at: Option<DateTime<Utc>>,
    /// Last `ResourceChanged` (resource) or `DeviceMetadataUpdated` (status).
    latest: Option<Event>,
    /// Published links keyed by href (links aggregate only).
    links: BTreeMap<String, ResourceLink>,
    /// Open commands in arrival order.
    pending: Vec<Event>,
    published: bool,
}

impl ResourceModel {
    /// Empty model at version 0.
    #[must_use]
    pub const fn new(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            version: 0,
            updated_at: None,
            latest: None,
            links: BTreeMap::new(),
            pending: Vec::new(),
            published: false,
        }
    }

    /// Aggregate identity.
    #[must_use]
    pub const fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Version of the last applied event, 0 if none.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Whether the device currently publishes this resource.
    #[must_use]
    pub const fn is_published(&self) -> bool {
        self.published
    }

    /// Connection status held by a status aggregate.
    #[must_use]
    pub fn connection(&self) -> Option<ConnectionStatus> {
        match self.latest.as_ref().map(|e| &e.kind) {
            Some(EventKind::DeviceMetadataUpdated { connection, .. }) => Some(*connection),
            _ => None,
        }
    }

    /// Returns `true` if this status aggregate reports the device online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.connection() == Some(ConnectionStatus::Online)
    }

    /// Latest content or metadata event.
    #[must_use]
    pub const fn latest(&self) -> Option<&Event> {
        self.latest.as_ref()
    }

    /// Currently published links.
    pub fn links(&self) -> impl Iterator<Item = &ResourceLink> {
        self.links.values()
    }

    /// Open commands.
    #[must_use]
    pub fn pending(&self) -> &[Event] {
        &self.pending
    }

    pub(crate) fn set_published(&mut self, published: bool) {
        self.published = published;
    }

    /// Folds one event into the model.
    ///
    /// Events whose version is not greater than the current version are
    /// rejected without side effects.
    pub fn apply(&mut self, event: &Event) -> ApplyOutcome {
        if event.version <= self.version {
            return ApplyOutcome::Stale {
                current: self.version,
            };
        }
        let was_online = self.connection();
        self.version = event.version;
        self.updated_at = Some(event.timestamp);

        match &event.kind {
            EventKind::ResourceLinksPublished { links } => {
                for link in links {
                    self.links.insert(link.href.clone(), link.clone());
                }
            }
            EventKind::ResourceLinksUnpublished { hrefs } => {
                if hrefs.is_empty() {
                    self.links.clear();
                }
                for href in hrefs {
                    self.links.remove(href);
                }
            }
            EventKind::ResourceChanged { .. } => self.latest = Some(event.clone()),
            EventKind::DeviceMetadataUpdated { correlation_id, .. } => {
                if let Some(id) = correlation_id {
                    self.resolve(id);
                }
                self.latest = Some(event.clone());
            }
            kind if kind.is_pending() => self.pending.push(event.clone()),
            kind => {
                if let Some(id) = kind.correlation_id() {
                    self.resolve(id);
                }
            }
        }

        let now_online = self.connection();
        ApplyOutcome::Applied {
            connection_changed: now_online.filter(|s| Some(*s) != was_online),
        }
    }

    fn resolve(&mut self, correlation_id: &str) {
        self.pending
            .retain(|p| p.kind.correlation_id() != Some(correlation_id));
    }

    /// Synthetic events describing the current state, oldest first.
    ///
    /// A links aggregate yields one `ResourceLinksPublished` carrying every
    /// current link at the model version.
    #[must_use]
    pub fn catch_up_events(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.pending.len() + 1);
        match self.resource_id.kind() {
            AggregateKind::Links => {
                if !self.links.is_empty() {
                    events.push(Event {
                        resource_id: self.resource_id.clone(),
                        version: self.version,
                        timestamp: self.updated_at.unwrap_or_else(Utc::now),
                        kind: EventKind::ResourceLinksPublished {
                            links: self.links.values().cloned().collect(),
                        },
                    });
                }
            }
            AggregateKind::Status | AggregateKind::Resource => {
                events.extend(self.latest.iter().cloned());
                events.extend(self.pending.iter().cloned());
            }
        }
        events.sort_by_key(|e| e.version);
        events
    }

    /// Completion payloads that cancel the matching open commands.
    ///
    /// An empty `correlation_ids` filter matches every open command.
    #[must_use]
    pub fn cancel_pending(&self, correlation_ids: &[String]) -> Vec<EventKind> {
        self.pending
            .iter()
            .filter(|p| {
                correlation_ids.is_empty()
                    || p.kind
                        .correlation_id()
                        .is_some_and(|id| correlation_ids.iter().any(|c| c == id))
            })
            .filter_map(|p| match &p.kind {
                EventKind::DeviceMetadataUpdatePending { correlation_id, .. } => {
                    let (connection, twin_enabled) = match self.latest.as_ref().map(|e| &e.kind) {
                        Some(EventKind::DeviceMetadataUpdated {
                            connection,
                            twin_enabled,
                            ..
                        }) => (*connection, *twin_enabled),
                        _ => (ConnectionStatus::Offline, true),
                    };
                    Some(EventKind::DeviceMetadataUpdated {
                        connection,
                        twin_enabled,
                        correlation_id: Some(correlation_id.clone()),
                        status: CommandStatus::Canceled,
                    })
                }
                kind => kind.canceled_completion(),
            })
            .collect()
    }
}

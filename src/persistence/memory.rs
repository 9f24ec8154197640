//! In-memory event store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{EventStore, OwnerDevices, SnapshotQuery};
use crate::domain::{Event, EventKind, OwnerEvent, OwnerEventKind, ResourceId};
use crate::error::GatewayError;

#[derive(Debug, Default)]
struct Inner {
    /// Ordered by aggregate so snapshot loads come out sorted.
    events: BTreeMap<ResourceId, Vec<Event>>,
    owners: HashMap<String, BTreeSet<String>>,
    owner_versions: HashMap<String, u64>,
}

/// Event store kept in process memory.
///
/// Counts snapshot loads so callers can assert how often the projection
/// reaches the store, and can be switched offline to simulate an
/// unreachable upstream.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    inner: RwLock<Inner>,
    load_count: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of [`EventStore::load`] calls served so far.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Makes every subsequent call fail with
    /// [`GatewayError::UpstreamUnavailable`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::UpstreamUnavailable(
                "memory event store is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn owner_event(inner: &mut Inner, owner: &str, kind: OwnerEventKind) -> OwnerEvent {
        let version = inner.owner_versions.entry(owner.to_string()).or_insert(0);
        *version += 1;
        OwnerEvent {
            owner: owner.to_string(),
            version: *version,
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(
        &self,
        resource_id: &ResourceId,
        kind: EventKind,
    ) -> Result<Event, GatewayError> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let log = inner.events.entry(resource_id.clone()).or_default();
        let version = log.last().map_or(0, |e| e.version) + 1;
        let event = Event {
            resource_id: resource_id.clone(),
            version,
            timestamp: Utc::now(),
            kind,
        };
        log.push(event.clone());
        Ok(event)
    }

    async fn load(&self, query: &SnapshotQuery) -> Result<Vec<Event>, GatewayError> {
        self.load_count.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|(id, _)| {
                id.device_id == query.device_id
                    && query.href.as_ref().is_none_or(|href| *href == id.href)
            })
            .flat_map(|(_, log)| log.iter().cloned())
            .collect())
    }

    async fn owner_devices(&self, owner: &str) -> Result<OwnerDevices, GatewayError> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(OwnerDevices {
            version: inner.owner_versions.get(owner).copied().unwrap_or_default(),
            device_ids: inner
                .owners
                .get(owner)
                .map(|devices| devices.iter().cloned().collect())
                .unwrap_or_default(),
        })
    }

    async fn register_device(
        &self,
        owner: &str,
        device_id: &str,
    ) -> Result<Option<OwnerEvent>, GatewayError> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        if !inner
            .owners
            .entry(owner.to_string())
            .or_default()
            .insert(device_id.to_string())
        {
            return Ok(None);
        }
        Ok(Some(Self::owner_event(
            &mut inner,
            owner,
            OwnerEventKind::DevicesRegistered {
                device_ids: vec![device_id.to_string()],
            },
        )))
    }

    async fn unregister_device(
        &self,
        owner: &str,
        device_id: &str,
    ) -> Result<Option<OwnerEvent>, GatewayError> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let removed = inner
            .owners
            .get_mut(owner)
            .is_some_and(|devices| devices.remove(device_id));
        if !removed {
            return Ok(None);
        }
        Ok(Some(Self::owner_event(
            &mut inner,
            owner,
            OwnerEventKind::DevicesUnregistered {
                device_ids: vec![device_id.to_string()],
            },
        )))
    }
}

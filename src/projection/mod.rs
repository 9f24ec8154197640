//! Projection: reference-counted read-model cache over the event store.
//!
//! One actor task owns every [`ResourceModel`]; [`Projection`] handles send
//! it commands over a channel and await replies, so no lock is ever shared
//! with subscribers.
//!
//! ```text
//!  register ──┐                     ┌── snapshot load task ──┐
//!  unregister ├─► mpsc ─► actor ────┤                        │
//!  models     │      ▲              └── feed task per device │
//!  apply ─────┘      └──────── Loaded / Apply ◄──────────────┘
//! ```
//!
//! A device entry is created on the first `register`: the actor subscribes
//! to the device topic first and then starts the snapshot load, so no live
//! event can fall between the two. Live events that arrive while loading
//! are buffered and folded after the snapshot. Concurrent `register` calls
//! for a loading device wait for the same load. When the reference count
//! drops to zero the entry stays cached for the configured TTL. A feed that
//! falls behind the bus triggers a reload of the device from the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::domain::{
    AggregateKind, ApplyOutcome, BusMessage, Event, EventBus, EventKind, FeedItem, LINKS_HREF,
    ResourceId, ResourceModel, Topic,
};
use crate::error::GatewayError;
use crate::persistence::{EventStore, SnapshotQuery};

const COMMAND_BUFFER: usize = 1024;

/// Lower bound of the idle eviction sweep period.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(50);

type Reply<T> = oneshot::Sender<Result<T, GatewayError>>;

enum Command {
    Register {
        device_id: String,
        reply: Reply<bool>,
    },
    Unregister {
        device_id: String,
        reply: Reply<()>,
    },
    Models {
        device_id: String,
        href: Option<String>,
        reply: Reply<Vec<ResourceModel>>,
    },
    Apply {
        event: Event,
        reply: Option<oneshot::Sender<Option<ApplyOutcome>>>,
    },
    Loaded {
        device_id: String,
        generation: u64,
        result: Result<Vec<Event>, GatewayError>,
    },
    Reload {
        device_id: String,
    },
    RefCount {
        device_id: String,
        reply: oneshot::Sender<Option<usize>>,
    },
}

/// Handle to the projection actor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Projection {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Register { .. } => "Register",
            Self::Unregister { .. } => "Unregister",
            Self::Models { .. } => "Models",
            Self::Apply { .. } => "Apply",
            Self::Loaded { .. } => "Loaded",
            Self::Reload { .. } => "Reload",
            Self::RefCount { .. } => "RefCount",
        };
        f.write_str(name)
    }
}

fn stopped() -> GatewayError {
    GatewayError::Internal("projection actor stopped".to_string())
}

impl Projection {
    /// Spawns the actor on the current tokio runtime.
    ///
    /// `cache_ttl` is how long a device with no references stays loaded;
    /// zero evicts immediately.
    #[must_use]
    pub fn spawn(store: Arc<dyn EventStore>, bus: EventBus, cache_ttl: Duration) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = Actor {
            store,
            bus,
            cache_ttl,
            devices: HashMap::new(),
            next_generation: 0,
            tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())
    }

    /// Takes a reference on `device_id`, loading it on first use.
    ///
    /// Returns `true` when the device was already loaded and no snapshot
    /// query was needed. Dropping the returned future before it resolves
    /// releases the reference again.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UpstreamUnavailable`] if the snapshot load
    /// fails; the reference is not kept.
    pub async fn register(&self, device_id: &str) -> Result<bool, GatewayError> {
        self.call(|reply| Command::Register {
            device_id: device_id.to_string(),
            reply,
        })
        .await?
    }

    /// Releases one reference on `device_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] if the device holds no reference.
    pub async fn unregister(&self, device_id: &str) -> Result<(), GatewayError> {
        self.call(|reply| Command::Unregister {
            device_id: device_id.to_string(),
            reply,
        })
        .await?
    }

    /// Snapshot copies of the models of a device, or of one href.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] if the device is not loaded.
    pub async fn models(
        &self,
        device_id: &str,
        href: Option<&str>,
    ) -> Result<Vec<ResourceModel>, GatewayError> {
        self.call(|reply| Command::Models {
            device_id: device_id.to_string(),
            href: href.map(str::to_string),
            reply,
        })
        .await?
    }

    /// Folds one event into the projection.
    ///
    /// Returns `None` when the device is not tracked, or is still loading and
    /// the event was buffered.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if the actor has stopped.
    pub async fn apply_event(&self, event: Event) -> Result<Option<ApplyOutcome>, GatewayError> {
        self.call(|reply| Command::Apply {
            event,
            reply: Some(reply),
        })
        .await
    }

    /// Current reference count of a device, `None` if it is not cached.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] if the actor has stopped.
    pub async fn ref_count(&self, device_id: &str) -> Result<Option<usize>, GatewayError> {
        self.call(|reply| Command::RefCount {
            device_id: device_id.to_string(),
            reply,
        })
        .await
    }
}

enum Phase {
    Loading {
        waiters: Vec<Reply<bool>>,
        buffered: Vec<Event>,
        /// Refreshing models that are already served.
        reload: bool,
    },
    Ready,
}

struct DeviceEntry {
    device_id: String,
    refs: usize,
    phase: Phase,
    models: BTreeMap<String, ResourceModel>,
    feed: JoinHandle<()>,
    idle_since: Option<Instant>,
    generation: u64,
}

impl DeviceEntry {
    fn link_published(&self, href: &str) -> bool {
        self.models
            .get(LINKS_HREF)
            .is_some_and(|m| {
                m.links()
                    .any(|l| l.href.trim_start_matches('/') == href.trim_start_matches('/'))
            })
    }

    fn model_mut(&mut self, resource_id: &ResourceId) -> &mut ResourceModel {
        let published = self.link_published(&resource_id.href);
        self.models
            .entry(resource_id.href.clone())
            .or_insert_with(|| {
                let mut model = ResourceModel::new(resource_id.clone());
                model.set_published(published);
                model
            })
    }

    fn fold(&mut self, event: &Event) -> ApplyOutcome {
        let outcome = self.model_mut(&event.resource_id).apply(event);
        match outcome {
            ApplyOutcome::Stale { current } => {
                debug!(
                    resource_id = %event.resource_id,
                    version = event.version,
                    current,
                    "stale event ignored"
                );
            }
            ApplyOutcome::Applied { connection_changed } => {
                if let Some(status) = connection_changed {
                    info!(device_id = %self.device_id, ?status, "device connection changed");
                }
                self.mark_published(&event.kind);
            }
        }
        outcome
    }

    fn mark_published(&mut self, kind: &EventKind) {
        match kind {
            EventKind::ResourceLinksPublished { links } => {
                for link in links {
                    let id = ResourceId::new(self.device_id.clone(), link.href.clone());
                    self.model_mut(&id).set_published(true);
                }
            }
            EventKind::ResourceLinksUnpublished { hrefs } if hrefs.is_empty() => {
                for model in self.models.values_mut() {
                    if model.resource_id().kind() == AggregateKind::Resource {
                        model.set_published(false);
                    }
                }
            }
            EventKind::ResourceLinksUnpublished { hrefs } => {
                for href in hrefs {
                    let id = ResourceId::new(self.device_id.clone(), href.clone());
                    if let Some(model) = self.models.get_mut(&id.href) {
                        model.set_published(false);
                    }
                }
            }
            _ => {}
        }
    }
}

struct Actor {
    store: Arc<dyn EventStore>,
    bus: EventBus,
    cache_ttl: Duration,
    devices: HashMap<String, DeviceEntry>,
    next_generation: u64,
    tx: mpsc::WeakSender<Command>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let mut sweep = tokio::time::interval((self.cache_ttl / 2).max(MIN_SWEEP_PERIOD));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = sweep.tick() => self.evict_idle(),
            }
        }
        for (_, entry) in self.devices.drain() {
            entry.feed.abort();
        }
        debug!("projection actor stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register { device_id, reply } => self.register(device_id, reply),
            Command::Unregister { device_id, reply } => {
                let result = self.unregister(&device_id);
                let _ = reply.send(result);
            }
            Command::Models {
                device_id,
                href,
                reply,
            } => {
                let _ = reply.send(self.models(&device_id, href.as_deref()));
            }
            Command::Apply { event, reply } => {
                let outcome = self.apply(event);
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Command::Loaded {
                device_id,
                generation,
                result,
            } => self.loaded(&device_id, generation, result),
            Command::Reload { device_id } => self.reload(&device_id),
            Command::RefCount { device_id, reply } => {
                let _ = reply.send(self.devices.get(&device_id).map(|e| e.refs));
            }
        }
    }

    fn register(&mut self, device_id: String, reply: Reply<bool>) {
        if let Some(entry) = self.devices.get_mut(&device_id) {
            entry.refs += 1;
            entry.idle_since = None;
            if let Phase::Loading {
                waiters,
                reload: false,
                ..
            } = &mut entry.phase
            {
                waiters.push(reply);
                return;
            }
            if reply.send(Ok(true)).is_err() {
                self.release(&device_id);
            }
            return;
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let feed = self.spawn_feed(&device_id);
        self.spawn_load(&device_id, generation);
        debug!(%device_id, generation, "loading device into projection");
        self.devices.insert(
            device_id.clone(),
            DeviceEntry {
                device_id,
                refs: 1,
                phase: Phase::Loading {
                    waiters: vec![reply],
                    buffered: Vec::new(),
                    reload: false,
                },
                models: BTreeMap::new(),
                feed,
                idle_since: None,
                generation,
            },
        );
    }

    fn spawn_feed(&self, device_id: &str) -> JoinHandle<()> {
        let mut feed = self.bus.subscribe(Topic::Device(device_id.to_string()));
        let tx = self.tx.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            while let Some(item) = feed.next_item().await {
                let cmd = match item {
                    FeedItem::Message(BusMessage::Event(event)) => {
                        Command::Apply { event, reply: None }
                    }
                    FeedItem::Message(BusMessage::Owner(_)) => continue,
                    FeedItem::Lagged(skipped) => {
                        warn!(%device_id, skipped, "projection feed lagged, reloading device");
                        Command::Reload {
                            device_id: device_id.clone(),
                        }
                    }
                };
                let Some(tx) = tx.upgrade() else { break };
                if tx.send(cmd).await.is_err() {
                    break;
                }
            }
        })
    }

    fn spawn_load(&self, device_id: &str, generation: u64) {
        let store = Arc::clone(&self.store);
        let tx = self.tx.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            let result = store.load(&SnapshotQuery::device(device_id.clone())).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(Command::Loaded {
                        device_id,
                        generation,
                        result,
                    })
                    .await;
            }
        });
    }

    fn loaded(&mut self, device_id: &str, generation: u64, result: Result<Vec<Event>, GatewayError>) {
        let Some(entry) = self.devices.get_mut(device_id) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        let Phase::Loading {
            waiters,
            buffered,
            reload,
        } = std::mem::replace(&mut entry.phase, Phase::Ready)
        else {
            return;
        };

        let events = match result {
            Ok(events) => events,
            Err(err) if reload => {
                warn!(%device_id, error = %err, "device reload failed, keeping current models");
                Vec::new()
            }
            Err(err) => {
                let err = match err {
                    err @ GatewayError::UpstreamUnavailable(_) => err,
                    other => GatewayError::UpstreamUnavailable(other.to_string()),
                };
                warn!(%device_id, error = %err, "snapshot load failed");
                if let Some(entry) = self.devices.remove(device_id) {
                    entry.feed.abort();
                }
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                return;
            }
        };

        for event in events.iter().chain(buffered.iter()) {
            entry.fold(event);
        }
        for waiter in waiters {
            if waiter.send(Ok(false)).is_err() {
                entry.refs = entry.refs.saturating_sub(1);
            }
        }
        info!(%device_id, models = entry.models.len(), refs = entry.refs, "device loaded");
        if entry.refs == 0 {
            self.idle(device_id);
        }
    }

    /// Refolds a ready device from the store after its feed dropped events.
    /// Models keep serving meanwhile; versions already folded are skipped.
    fn reload(&mut self, device_id: &str) {
        let generation = self.next_generation;
        let Some(entry) = self.devices.get_mut(device_id) else {
            return;
        };
        if !matches!(entry.phase, Phase::Ready) {
            return;
        }
        self.next_generation += 1;
        entry.generation = generation;
        entry.phase = Phase::Loading {
            waiters: Vec::new(),
            buffered: Vec::new(),
            reload: true,
        };
        self.spawn_load(device_id, generation);
    }

    fn release(&mut self, device_id: &str) {
        if let Some(entry) = self.devices.get_mut(device_id) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 && matches!(entry.phase, Phase::Ready) {
                self.idle(device_id);
            }
        }
    }

    fn unregister(&mut self, device_id: &str) -> Result<(), GatewayError> {
        match self.devices.get(device_id) {
            Some(entry) if entry.refs > 0 => {
                self.release(device_id);
                Ok(())
            }
            _ => Err(GatewayError::NotFound(format!(
                "device {device_id} is not registered"
            ))),
        }
    }

    fn idle(&mut self, device_id: &str) {
        if self.cache_ttl.is_zero() {
            self.evict(device_id);
        } else if let Some(entry) = self.devices.get_mut(device_id) {
            entry.idle_since = Some(Instant::now());
        }
    }

    fn evict(&mut self, device_id: &str) {
        if let Some(entry) = self.devices.remove(device_id) {
            entry.feed.abort();
            debug!(%device_id, "device evicted from projection");
        }
    }

    fn evict_idle(&mut self) {
        let ttl = self.cache_ttl;
        let expired: Vec<String> = self
            .devices
            .values()
            .filter(|e| e.refs == 0 && e.idle_since.is_some_and(|t| t.elapsed() >= ttl))
            .map(|e| e.device_id.clone())
            .collect();
        for device_id in expired {
            self.evict(&device_id);
        }
    }

    fn models(
        &self,
        device_id: &str,
        href: Option<&str>,
    ) -> Result<Vec<ResourceModel>, GatewayError> {
        let entry = self
            .devices
            .get(device_id)
            .filter(|e| matches!(e.phase, Phase::Ready | Phase::Loading { reload: true, .. }))
            .ok_or_else(|| GatewayError::NotFound(format!("device {device_id} is not loaded")))?;
        let href = href.map(|h| ResourceId::new(device_id, h).href);
        Ok(entry
            .models
            .values()
            .filter(|m| href.as_ref().is_none_or(|h| m.resource_id().href == *h))
            .cloned()
            .collect())
    }

    fn apply(&mut self, event: Event) -> Option<ApplyOutcome> {
        let entry = self.devices.get_mut(event.device_id())?;
        match &mut entry.phase {
            Phase::Loading { buffered, .. } => {
                buffered.push(event);
                None
            }
            Phase::Ready => Some(entry.fold(&event)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::domain::{CommandStatus, Content, OwnerEvent, ResourceLink};
    use crate::persistence::{MemoryEventStore, OwnerDevices};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    fn changed(value: i64) -> EventKind {
        EventKind::ResourceChanged {
            content: Content::json(serde_json::json!({ "value": value })),
            status: CommandStatus::Ok,
        }
    }

    async fn seeded_store(device_id: &str, hrefs: &[&str]) -> Arc<MemoryEventStore> {
        let store = Arc::new(MemoryEventStore::new());
        for href in hrefs {
            let Ok(_) = store.append(&ResourceId::new(device_id, *href), changed(1)).await else {
                panic!("append failed");
            };
        }
        store
    }

    async fn wait_for_receivers(bus: &EventBus, expected: usize) {
        for _ in 0..100 {
            if bus.receiver_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "receiver count stuck at {} (expected {expected})",
            bus.receiver_count()
        );
    }

    /// Store whose snapshot loads block until released.
    #[derive(Debug)]
    struct GatedStore {
        inner: Arc<MemoryEventStore>,
        gate: Semaphore,
        loads: AtomicUsize,
    }

    #[async_trait]
    impl EventStore for GatedStore {
        async fn append(
            &self,
            resource_id: &ResourceId,
            kind: EventKind,
        ) -> Result<Event, GatewayError> {
            self.inner.append(resource_id, kind).await
        }

        async fn load(&self, query: &SnapshotQuery) -> Result<Vec<Event>, GatewayError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| GatewayError::Internal(e.to_string()))?;
            self.inner.load(query).await
        }

        async fn owner_devices(&self, owner: &str) -> Result<OwnerDevices, GatewayError> {
            self.inner.owner_devices(owner).await
        }

        async fn register_device(
            &self,
            owner: &str,
            device_id: &str,
        ) -> Result<Option<OwnerEvent>, GatewayError> {
            self.inner.register_device(owner, device_id).await
        }

        async fn unregister_device(
            &self,
            owner: &str,
            device_id: &str,
        ) -> Result<Option<OwnerEvent>, GatewayError> {
            self.inner.unregister_device(owner, device_id).await
        }
    }

    #[tokio::test]
    async fn register_loads_snapshot_once_then_serves_from_cache() {
        let store = seeded_store("d", &["/a", "/b"]).await;
        let projection = Projection::spawn(
            Arc::clone(&store) as Arc<dyn EventStore>,
            EventBus::new(64),
            Duration::ZERO,
        );

        let Ok(cached) = projection.register("d").await else {
            panic!("register failed");
        };
        assert!(!cached);
        let Ok(cached) = projection.register("d").await else {
            panic!("register failed");
        };
        assert!(cached);
        assert_eq!(store.load_count(), 1);

        let Ok(models) = projection.models("d", None).await else {
            panic!("models failed");
        };
        assert_eq!(models.len(), 2);
        let Ok(one) = projection.models("d", Some("b")).await else {
            panic!("models failed");
        };
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].version(), 1);
    }

    #[tokio::test]
    async fn concurrent_registers_collapse_into_one_load() {
        let inner = seeded_store("d", &["/a", "/b", "/c"]).await;
        let store = Arc::new(GatedStore {
            inner,
            gate: Semaphore::new(0),
            loads: AtomicUsize::new(0),
        });
        let projection = Projection::spawn(
            Arc::clone(&store) as Arc<dyn EventStore>,
            EventBus::new(64),
            Duration::ZERO,
        );

        let first = tokio::spawn({
            let projection = projection.clone();
            async move { projection.register("d").await }
        });
        let second = tokio::spawn({
            let projection = projection.clone();
            async move { projection.register("d").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.gate.add_permits(1);

        let (Ok(Ok(_)), Ok(Ok(_))) = (first.await, second.await) else {
            panic!("both registrations succeed");
        };
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        assert!(matches!(projection.ref_count("d").await, Ok(Some(2))));
        let Ok(models) = projection.models("d", None).await else {
            panic!("models failed");
        };
        assert_eq!(models.len(), 3);
    }

    #[tokio::test]
    async fn balanced_register_unregister_releases_everything() {
        let store = seeded_store("d", &["/a"]).await;
        let bus = EventBus::new(64);
        let baseline = bus.receiver_count();
        let projection = Projection::spawn(
            Arc::clone(&store) as Arc<dyn EventStore>,
            bus.clone(),
            Duration::ZERO,
        );

        let registrations: Vec<_> = (0..8)
            .map(|_| {
                let projection = projection.clone();
                tokio::spawn(async move { projection.register("d").await })
            })
            .collect();
        for handle in registrations {
            let Ok(Ok(_)) = handle.await else {
                panic!("register failed");
            };
        }
        assert_eq!(bus.receiver_count(), baseline + 1);
        for _ in 0..8 {
            let Ok(()) = projection.unregister("d").await else {
                panic!("unregister failed");
            };
        }

        assert!(matches!(projection.ref_count("d").await, Ok(None)));
        assert_eq!(store.load_count(), 1);
        wait_for_receivers(&bus, baseline).await;
        assert!(matches!(
            projection.unregister("d").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_load_rolls_back_registration() {
        let store = seeded_store("d", &["/a"]).await;
        let bus = EventBus::new(64);
        let projection = Projection::spawn(
            Arc::clone(&store) as Arc<dyn EventStore>,
            bus.clone(),
            Duration::ZERO,
        );

        store.set_unavailable(true);
        assert!(matches!(
            projection.register("d").await,
            Err(GatewayError::UpstreamUnavailable(_))
        ));
        assert!(matches!(projection.ref_count("d").await, Ok(None)));
        wait_for_receivers(&bus, 0).await;

        store.set_unavailable(false);
        assert!(matches!(projection.register("d").await, Ok(false)));
    }

    #[tokio::test]
    async fn live_events_fold_and_stale_ones_are_rejected() {
        let store = seeded_store("d", &["/a"]).await;
        let bus = EventBus::new(64);
        let projection = Projection::spawn(
            Arc::clone(&store) as Arc<dyn EventStore>,
            bus.clone(),
            Duration::ZERO,
        );
        let Ok(_) = projection.register("d").await else {
            panic!("register failed");
        };

        let Ok(event) = store.append(&ResourceId::new("d", "/a"), changed(2)).await else {
            panic!("append failed");
        };
        bus.publish(event.clone());

        let mut version = 0;
        for _ in 0..100 {
            let Ok(models) = projection.models("d", Some("/a")).await else {
                panic!("models failed");
            };
            version = models[0].version();
            if version == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(version, 2);

        let stale = Event {
            version: 1,
            ..event
        };
        assert!(matches!(
            projection.apply_event(stale).await,
            Ok(Some(ApplyOutcome::Stale { current: 2 }))
        ));
    }

    #[tokio::test]
    async fn idle_devices_stay_cached_until_ttl_expires() {
        let store = seeded_store("d", &["/a"]).await;
        let projection = Projection::spawn(
            Arc::clone(&store) as Arc<dyn EventStore>,
            EventBus::new(64),
            Duration::from_millis(150),
        );

        let Ok(false) = projection.register("d").await else {
            panic!("first register loads");
        };
        let Ok(()) = projection.unregister("d").await else {
            panic!("unregister failed");
        };
        assert!(matches!(projection.ref_count("d").await, Ok(Some(0))));
        assert!(matches!(projection.register("d").await, Ok(true)));
        let Ok(()) = projection.unregister("d").await else {
            panic!("unregister failed");
        };

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(matches!(projection.ref_count("d").await, Ok(None)));
        assert_eq!(store.load_count(), 1);
    }

    #[tokio::test]
    async fn published_links_mark_resources() {
        let store = seeded_store("d", &["/a", "/b"]).await;
        let Ok(_) = store
            .append(
                &ResourceId::links("d"),
                EventKind::ResourceLinksPublished {
                    links: vec![ResourceLink {
                        href: "/a".into(),
                        resource_types: vec!["oic.r.switch.binary".into()],
                        interfaces: vec![],
                    }],
                },
            )
            .await
        else {
            panic!("append failed");
        };
        let projection =
            Projection::spawn(store as Arc<dyn EventStore>, EventBus::new(64), Duration::ZERO);
        let Ok(_) = projection.register("d").await else {
            panic!("register failed");
        };

        let Ok(a) = projection.models("d", Some("/a")).await else {
            panic!("models failed");
        };
        let Ok(b) = projection.models("d", Some("/b")).await else {
            panic!("models failed");
        };
        assert!(a[0].is_published());
        assert!(!b[0].is_published());
    }

    #[tokio::test]
    async fn models_of_unknown_device_is_not_found() {
        let projection = Projection::spawn(
            Arc::new(MemoryEventStore::new()),
            EventBus::new(8),
            Duration::ZERO,
        );
        assert!(matches!(
            projection.models("ghost", None).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn lagging_feed_reloads_the_device() {
        let store = seeded_store("d", &["/a"]).await;
        let bus = EventBus::new(2);
        let projection = Projection::spawn(
            Arc::clone(&store) as Arc<dyn EventStore>,
            bus.clone(),
            Duration::ZERO,
        );
        let Ok(false) = projection.register("d").await else {
            panic!("first register loads");
        };

        let mut events = Vec::new();
        for (href, value) in [("/a", 2), ("/a", 3), ("/a", 4), ("/b", 1), ("/b", 2)] {
            let Ok(event) = store.append(&ResourceId::new("d", href), changed(value)).await else {
                panic!("append failed");
            };
            events.push(event);
        }
        // No await between publishes: the feed task cannot keep up.
        for event in events {
            bus.publish(event);
        }

        let mut version = 0;
        for _ in 0..100 {
            if let Ok(models) = projection.models("d", Some("/a")).await
                && let Some(model) = models.first()
            {
                version = model.version();
                if version == 4 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(version, 4);
        assert_eq!(store.load_count(), 2);
        assert!(matches!(projection.ref_count("d").await, Ok(Some(1))));
    }
}

//! Subscription: one consumer's filtered, deduplicated live view.
//!
//! Lifecycle: `Created → Initializing → Live → Canceled`.
//!
//! [`Subscription::init`] resolves the devices of interest, takes a
//! projection reference on each, starts one feed forwarder per device plus
//! one for the owner topic, and prepares the catch-up burst from projection
//! snapshots. [`Subscription::start`] moves the subscription into its own
//! delivery task, which sends the burst and then processes live messages
//! from its inbox until canceled. Every frame goes to the stream's single
//! writer through an `mpsc` sender.

pub mod dedup;
pub mod filter;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub use dedup::DedupTable;
pub use filter::{SubscriptionFilter, SubscriptionKind, SubscriptionRequest, connection_event_type};

use crate::domain::{
    AggregateKind, BusMessage, ConnectionStatus, Event, EventBus, EventKind, EventType,
    OwnerEvent, OwnerEventKind, ResourceModel, SubscriptionId, Topic,
};
use crate::error::GatewayError;
use crate::persistence::EventStore;
use crate::projection::Projection;
use crate::ws::messages::{EventMessage, ServerMessage};

/// Dedup key of an owner's device-set changes.
fn owner_aggregate(owner: &str) -> String {
    format!("owner:{owner}")
}

/// Lifecycle state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Constructed, nothing registered yet.
    Created,
    /// Registering devices and building the catch-up burst.
    Initializing,
    /// Catch-up burst sent; forwarding live events.
    Live,
    /// Terminal.
    Canceled,
}

/// Notification that a subscription canceled itself.
#[derive(Debug, Clone)]
pub struct SubscriptionClosed {
    /// The subscription.
    pub id: SubscriptionId,
    /// Why it stopped.
    pub error: GatewayError,
}

/// Shared collaborators every subscription is built from.
#[derive(Debug, Clone)]
pub struct SubscriptionEngine {
    projection: Projection,
    bus: EventBus,
    store: Arc<dyn EventStore>,
    dedup_expiration: Duration,
    inbox_capacity: usize,
}

impl SubscriptionEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(
        projection: Projection,
        bus: EventBus,
        store: Arc<dyn EventStore>,
        dedup_expiration: Duration,
        inbox_capacity: usize,
    ) -> Self {
        Self {
            projection,
            bus,
            store,
            dedup_expiration,
            inbox_capacity: inbox_capacity.max(1),
        }
    }

    /// Projection shared by every subscription.
    #[must_use]
    pub const fn projection(&self) -> &Projection {
        &self.projection
    }

    /// Validates `request` and constructs a subscription in `Created` state.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidSubscription`] or
    /// [`GatewayError::InvalidRequest`] for a filter that cannot be served.
    /// Nothing is registered in that case.
    pub fn create(
        &self,
        owner: &str,
        request: &SubscriptionRequest,
        sink: mpsc::Sender<ServerMessage>,
    ) -> Result<Subscription, GatewayError> {
        let filter = SubscriptionFilter::from_request(request)?;
        let (inbox_tx, inbox_rx) = mpsc::channel(self.inbox_capacity);
        let (state, _) = watch::channel(SubscriptionState::Created);
        Ok(Subscription {
            id: SubscriptionId::new(),
            owner: owner.to_string(),
            filter,
            engine: self.clone(),
            sink,
            state,
            inbox_tx,
            inbox_rx,
            devices: BTreeMap::new(),
            owner_feed: None,
            dedup: DedupTable::new(),
            connection: HashMap::new(),
            burst: Vec::new(),
        })
    }
}

/// A server-side subscription before it is started.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    owner: String,
    filter: SubscriptionFilter,
    engine: SubscriptionEngine,
    sink: mpsc::Sender<ServerMessage>,
    state: watch::Sender<SubscriptionState>,
    inbox_tx: mpsc::Sender<BusMessage>,
    inbox_rx: mpsc::Receiver<BusMessage>,
    /// Followed devices and their feed forwarders.
    devices: BTreeMap<String, JoinHandle<()>>,
    owner_feed: Option<JoinHandle<()>>,
    dedup: DedupTable,
    /// Last connection status seen per device, with its version.
    connection: HashMap<String, (u64, ConnectionStatus)>,
    burst: Vec<EventMessage>,
}

impl Subscription {
    /// Server-assigned identifier.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Validated filter.
    #[must_use]
    pub const fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }

    /// Number of catch-up events prepared by [`Subscription::init`].
    #[must_use]
    pub fn burst_len(&self) -> usize {
        self.burst.len()
    }

    /// Registers the devices of interest and prepares the catch-up burst.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`] when owner scoping leaves nothing
    /// to follow and [`GatewayError::UpstreamUnavailable`] when the store
    /// cannot be reached. Every registration already taken is released and
    /// the subscription ends up `Canceled`.
    pub async fn init(&mut self) -> Result<(), GatewayError> {
        self.state.send_replace(SubscriptionState::Initializing);
        let started = Instant::now();
        match self.seed(started).await {
            Ok(()) => {
                debug!(
                    subscription_id = %self.id,
                    kind = self.filter.kind().name(),
                    devices = self.devices.len(),
                    burst = self.burst.len(),
                    "subscription initialized"
                );
                Ok(())
            }
            Err(err) => {
                self.release().await;
                self.state.send_replace(SubscriptionState::Canceled);
                Err(err)
            }
        }
    }

    async fn seed(&mut self, started: Instant) -> Result<(), GatewayError> {
        // Owner feed before the device set, so no registration falls in between.
        self.owner_feed = Some(self.spawn_forwarder(Topic::Owner(self.owner.clone())));
        let owned = self.engine.store.owner_devices(&self.owner).await?;
        let devices = self.filter.devices_of_interest(&owned.device_ids)?;

        let mut models = Vec::new();
        for device_id in &devices {
            models.extend(self.follow(device_id).await?);
        }

        let valid_until = Instant::now() + started.elapsed() + self.engine.dedup_expiration;
        if owned.version > 0 {
            let owner_key = owner_aggregate(&self.owner);
            for event_type in [EventType::DeviceRegistered, EventType::DeviceUnregistered] {
                self.dedup
                    .record(&owner_key, event_type, owned.version, valid_until);
            }
        }

        let mut burst = self.catch_up(&models, valid_until);
        burst.sort_by(|a, b| {
            (a.aggregate_id.as_str(), a.version).cmp(&(b.aggregate_id.as_str(), b.version))
        });
        if matches!(self.filter.kind(), SubscriptionKind::DevicesWide)
            && self.filter.events().contains(EventType::DeviceRegistered)
            && !devices.is_empty()
        {
            let registered = OwnerEvent {
                owner: self.owner.clone(),
                version: owned.version,
                timestamp: Utc::now(),
                kind: OwnerEventKind::DevicesRegistered {
                    device_ids: devices.into_iter().collect(),
                },
            };
            burst.insert(0, EventMessage::from_owner_event(self.id, &registered));
        }
        self.burst = burst;
        Ok(())
    }

    /// Starts following a device: forwarder first, then the projection
    /// reference, then the snapshot, so no live event falls in between.
    async fn follow(&mut self, device_id: &str) -> Result<Vec<ResourceModel>, GatewayError> {
        let forwarder = self.spawn_forwarder(Topic::Device(device_id.to_string()));
        if let Err(err) = self.engine.projection.register(device_id).await {
            forwarder.abort();
            return Err(err);
        }
        self.devices.insert(device_id.to_string(), forwarder);
        self.engine.projection.models(device_id, None).await
    }

    async fn unfollow(&mut self, device_id: &str) {
        if let Some(forwarder) = self.devices.remove(device_id) {
            forwarder.abort();
            if let Err(err) = self.engine.projection.unregister(device_id).await {
                warn!(subscription_id = %self.id, %device_id, error = %err, "projection unregister failed");
            }
        }
        self.connection.remove(device_id);
    }

    fn spawn_forwarder(&self, topic: Topic) -> JoinHandle<()> {
        let mut feed = self.engine.bus.subscribe(topic);
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = feed.recv().await {
                if inbox.send(msg).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Builds catch-up frames for `models` and records them in the dedup
    /// table under every receivable type at the model version.
    fn catch_up(&mut self, models: &[ResourceModel], valid_until: Instant) -> Vec<EventMessage> {
        let events = self.filter.events();
        let mut frames = Vec::new();
        for model in models {
            if model.version() == 0 || !self.filter.matches_resource(model.resource_id()) {
                continue;
            }
            let aggregate_id = model.resource_id().aggregate_id();
            for event_type in events.iter() {
                self.dedup
                    .record(&aggregate_id, event_type, model.version(), valid_until);
            }
            for event in model.catch_up_events() {
                if events.contains(event.event_type()) {
                    frames.push(EventMessage::from_event(self.id, event.event_type(), &event));
                }
            }
            if model.resource_id().kind() == AggregateKind::Status
                && let (Some(status), Some(latest)) = (model.connection(), model.latest())
            {
                self.connection.insert(
                    model.resource_id().device_id.clone(),
                    (model.version(), status),
                );
                let derived = connection_event_type(status);
                if events.contains(derived) {
                    frames.push(EventMessage::from_event(self.id, derived, latest));
                }
            }
        }
        frames
    }

    /// Releases every registration taken so far.
    async fn release(&mut self) {
        if let Some(feed) = self.owner_feed.take() {
            feed.abort();
        }
        let devices: Vec<String> = self.devices.keys().cloned().collect();
        for device_id in devices {
            self.unfollow(&device_id).await;
        }
    }

    /// Moves the subscription into its delivery task.
    ///
    /// The task first sends the catch-up burst, then live events. A
    /// subscription that cancels itself reports through `closed`.
    #[must_use]
    pub fn start(self, closed: mpsc::UnboundedSender<SubscriptionClosed>) -> SubscriptionHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let canceled = Arc::new(AtomicBool::new(false));
        let handle = SubscriptionHandle {
            id: self.id,
            canceled: Arc::clone(&canceled),
            cancel_tx,
            state: self.state.subscribe(),
        };
        tokio::spawn(self.run(cancel_rx, canceled, closed));
        handle
    }

    async fn run(
        mut self,
        mut cancel_rx: watch::Receiver<bool>,
        canceled: Arc<AtomicBool>,
        closed: mpsc::UnboundedSender<SubscriptionClosed>,
    ) {
        let outcome = self.deliver(&mut cancel_rx).await;
        self.release().await;

        if let Err(error) = outcome
            && canceled
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            info!(subscription_id = %self.id, %error, "subscription canceled itself");
            let _ = closed.send(SubscriptionClosed { id: self.id, error });
        }
        canceled.store(true, Ordering::SeqCst);
        self.state.send_replace(SubscriptionState::Canceled);
        debug!(subscription_id = %self.id, "subscription torn down");
    }

    /// Runs until canceled (`Ok`), the stream writer is gone (`Ok`), or the
    /// subscription fails (`Err`).
    async fn deliver(&mut self, cancel_rx: &mut watch::Receiver<bool>) -> Result<(), GatewayError> {
        for frame in std::mem::take(&mut self.burst) {
            if *cancel_rx.borrow() {
                return Ok(());
            }
            if self.sink.send(ServerMessage::Event(frame)).await.is_err() {
                return Ok(());
            }
        }
        self.state.send_replace(SubscriptionState::Live);

        let mut expiry =
            tokio::time::interval(self.engine.dedup_expiration.max(Duration::from_secs(1)));
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        return Ok(());
                    }
                }
                msg = self.inbox_rx.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    match self.process(msg).await {
                        Ok(true) => {}
                        Ok(false) => return Ok(()),
                        Err(err) => return Err(err),
                    }
                }
                _ = expiry.tick() => {
                    let dropped = self.dedup.drop_expired(Instant::now());
                    if dropped > 0 {
                        debug!(subscription_id = %self.id, dropped, "expired dedup entries dropped");
                    }
                }
            }
        }
    }

    /// Processes one live message. Returns `Ok(false)` once the stream
    /// writer is gone.
    async fn process(&mut self, msg: BusMessage) -> Result<bool, GatewayError> {
        self.dedup.drop_expired(Instant::now());
        match msg {
            BusMessage::Event(event) => Ok(self.process_event(&event).await),
            BusMessage::Owner(event) => self.process_owner(&event).await,
        }
    }

    async fn process_event(&mut self, event: &Event) -> bool {
        let device_id = event.device_id();
        if !self.devices.contains_key(device_id) {
            return true;
        }
        let tracked = self.connection.get(device_id).copied();
        let previous = tracked.map(|(_, status)| status);
        let newer = tracked.is_none_or(|(version, _)| event.version > version);
        // An out-of-order metadata event must not flip the tracked status.
        let types: Vec<EventType> = if newer {
            self.filter.route(event, previous)
        } else {
            self.filter
                .route(event, previous)
                .into_iter()
                .filter(|t| !matches!(t, EventType::DeviceOnline | EventType::DeviceOffline))
                .collect()
        };
        if newer && let EventKind::DeviceMetadataUpdated { connection, .. } = &event.kind {
            self.connection
                .insert(device_id.to_string(), (event.version, *connection));
        }

        let aggregate_id = event.aggregate_id();
        let valid_until = Instant::now() + self.engine.dedup_expiration;
        for event_type in types {
            if self.dedup.is_duplicate(&aggregate_id, event_type, event.version) {
                debug!(
                    subscription_id = %self.id,
                    %aggregate_id,
                    %event_type,
                    version = event.version,
                    "duplicate event suppressed"
                );
                continue;
            }
            let frame = EventMessage::from_event(self.id, event_type, event);
            if self.sink.send(ServerMessage::Event(frame)).await.is_err() {
                return false;
            }
            self.dedup
                .record(&aggregate_id, event_type, event.version, valid_until);
        }
        true
    }

    async fn process_owner(&mut self, event: &OwnerEvent) -> Result<bool, GatewayError> {
        let aggregate_id = owner_aggregate(&event.owner);
        let event_type = event.event_type();
        if self.dedup.is_duplicate(&aggregate_id, event_type, event.version) {
            return Ok(true);
        }
        let valid_until = Instant::now() + self.engine.dedup_expiration;
        self.dedup
            .record(&aggregate_id, event_type, event.version, valid_until);

        let touched: Vec<String> = event
            .device_ids()
            .iter()
            .filter(|d| self.filter.wants_device(d))
            .cloned()
            .collect();
        if touched.is_empty() {
            return Ok(true);
        }

        if self.filter.events().contains(event_type) {
            let frame = EventMessage::from_owner_event(self.id, event);
            if self.sink.send(ServerMessage::Event(frame)).await.is_err() {
                return Ok(false);
            }
        }

        match &event.kind {
            OwnerEventKind::DevicesRegistered { .. } => {
                for device_id in &touched {
                    if self.devices.contains_key(device_id) {
                        continue;
                    }
                    let started = Instant::now();
                    let models = self.follow(device_id).await?;
                    let valid_until =
                        Instant::now() + started.elapsed() + self.engine.dedup_expiration;
                    for frame in self.catch_up(&models, valid_until) {
                        if self.sink.send(ServerMessage::Event(frame)).await.is_err() {
                            return Ok(false);
                        }
                    }
                    info!(subscription_id = %self.id, %device_id, "device added to subscription");
                }
            }
            OwnerEventKind::DevicesUnregistered { .. } => {
                for device_id in &touched {
                    self.unfollow(device_id).await;
                    info!(subscription_id = %self.id, %device_id, "device removed from subscription");
                }
            }
        }

        if self.filter.is_scoped() && self.devices.is_empty() {
            return Err(GatewayError::NotFound(
                "every device of the subscription was unregistered".to_string(),
            ));
        }
        Ok(true)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(feed) = self.owner_feed.take() {
            feed.abort();
        }
        if self.devices.is_empty() {
            return;
        }
        let devices: Vec<String> = std::mem::take(&mut self.devices)
            .into_iter()
            .map(|(device_id, forwarder)| {
                forwarder.abort();
                device_id
            })
            .collect();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let projection = self.engine.projection.clone();
            runtime.spawn(async move {
                for device_id in devices {
                    let _ = projection.unregister(&device_id).await;
                }
            });
        }
    }
}

/// Control handle of a started subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    canceled: Arc<AtomicBool>,
    cancel_tx: watch::Sender<bool>,
    state: watch::Receiver<SubscriptionState>,
}

impl SubscriptionHandle {
    /// Subscription identifier.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Returns `true` once cancellation was requested or happened.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Requests cancellation. Idempotent: only the first call signals the
    /// delivery task; every call returns a waiter for teardown.
    pub fn cancel(&self) -> CancelWait {
        let initiated = self
            .canceled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if initiated {
            self.cancel_tx.send_replace(true);
        }
        CancelWait {
            state: self.state.clone(),
            initiated,
        }
    }
}

/// Waits for a subscription's teardown to finish.
#[derive(Debug)]
pub struct CancelWait {
    state: watch::Receiver<SubscriptionState>,
    initiated: bool,
}

impl CancelWait {
    /// Returns `true` if this cancel call was the one that canceled.
    #[must_use]
    pub const fn initiated(&self) -> bool {
        self.initiated
    }

    /// Resolves once the delivery task has released every registration.
    pub async fn wait(mut self) {
        let _ = self
            .state
            .wait_for(|s| *s == SubscriptionState::Canceled)
            .await;
    }
}

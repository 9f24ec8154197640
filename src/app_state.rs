//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::domain::EventBus;
use crate::persistence::EventStore;
use crate::projection::Projection;
use crate::service::EventService;
use crate::subscription::SubscriptionEngine;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Write side: append and publish.
    pub event_service: Arc<EventService>,
    /// Builds subscriptions for stream dispatchers.
    pub engine: SubscriptionEngine,
    /// Live feed shared by the projection and every subscription.
    pub event_bus: EventBus,
    /// Settings the handlers consult per request.
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    /// Wires the projection, subscription engine and event service around
    /// one store and one bus.
    ///
    /// Must be called from within a tokio runtime: the projection actor is
    /// spawned here.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, config: GatewayConfig) -> Self {
        let event_bus = EventBus::new(config.event_bus_capacity);
        let projection = Projection::spawn(
            Arc::clone(&store),
            event_bus.clone(),
            config.projection_cache_ttl(),
        );
        let engine = SubscriptionEngine::new(
            projection,
            event_bus.clone(),
            Arc::clone(&store),
            config.dedup_expiration(),
            config.subscription_buffer_size,
        );
        let event_service = Arc::new(EventService::new(store, event_bus.clone()));
        Self {
            event_service,
            engine,
            event_bus,
            config: Arc::new(config),
        }
    }
}

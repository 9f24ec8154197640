//! # ocf-event-gateway
//!
//! Event subscription and resource-projection engine of an OCF-style IoT
//! gateway.
//!
//! Devices and resources are event-sourced aggregates. The gateway keeps a
//! reference-counted, versioned read model of every device a client is
//! watching, and serves many independently filtered subscriptions over one
//! duplex stream per client: catch-up from the read model, then live events,
//! deduplicated per `(aggregate, event type)` so no version is delivered
//! twice.
//!
//! ## Architecture
//!
//! ```text
//! Clients (WebSocket /ws)             Ingestion (REST /api/v1)
//!     │                                   │
//!     ├── Dispatcher (ws/)                ├── EventService (service/)
//!     │     └── Subscription (subscription/)
//!     │            ├── DedupTable         │
//!     │            └── feed forwarders ◄──┼── EventBus (domain/)
//!     │                                   │
//!     ├── Projection actor (projection/) ◄┘
//!     │
//!     └── EventStore (persistence/): memory or PostgreSQL
//! ```

pub mod api;
pub mod app;
pub mod app_state;
pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod projection;
pub mod service;
pub mod subscription;
pub mod transport;
pub mod ws;

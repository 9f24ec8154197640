//! Service layer: write-side orchestration.
//!
//! [`EventService`] appends events and ownership changes to the store and
//! publishes them through the [`super::domain::EventBus`].

pub mod event_service;

pub use event_service::EventService;

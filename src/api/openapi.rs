//! OpenAPI document of the HTTP surface.
//!
//! The `/ws` stream protocol is not an HTTP operation; its frame types are
//! documented in [`crate::ws::messages`].

use utoipa::OpenApi;

use crate::api::dto::{
    AppendEventRequest, CancelPendingRequest, CancelPendingResponse, EventDto, OwnershipResponse,
};
use crate::api::handlers::{events, system};
use crate::domain::{CommandStatus, ConnectionStatus, Content, EventKind, EventType, ResourceLink};
use crate::error::{ErrorBody, ErrorResponse, StatusCode};
use crate::subscription::SubscriptionRequest;

/// Aggregated OpenAPI document.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "ocf-event-gateway",
        version = "v1",
        description = "Event ingestion and device ownership API of the OCF event gateway"
    ),
    paths(
        system::health_handler,
        events::append_event,
        events::register_device,
        events::unregister_device,
        events::cancel_pending_commands,
    ),
    components(schemas(
        AppendEventRequest,
        CancelPendingRequest,
        CancelPendingResponse,
        EventDto,
        OwnershipResponse,
        EventKind,
        EventType,
        Content,
        CommandStatus,
        ConnectionStatus,
        ResourceLink,
        SubscriptionRequest,
        StatusCode,
        ErrorResponse,
        ErrorBody,
        system::HealthResponse,
    )),
    tags(
        (name = "System", description = "Service health"),
        (name = "Events", description = "Event ingestion"),
        (name = "Devices", description = "Device ownership"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_ingestion_routes() {
        let doc = ApiDoc::openapi();
        let paths = &doc.paths.paths;
        assert!(paths.contains_key("/api/v1/events"));
        assert!(paths.contains_key("/api/v1/pending-commands/cancel"));
        assert!(paths.contains_key("/api/v1/owners/{owner}/devices/{device_id}"));
        assert!(paths.contains_key("/health"));
    }
}

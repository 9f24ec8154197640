//! Ingestion handlers: append events, manage device ownership, cancel
//! pending commands.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{post, put};
use axum::{Json, Router};

use crate::api::dto::{
    AppendEventRequest, CancelPendingRequest, CancelPendingResponse, EventDto, OwnershipResponse,
};
use crate::app_state::AppState;
use crate::domain::ResourceId;
use crate::error::{ErrorResponse, GatewayError};

/// `POST /events`: Append an event to an aggregate and publish it.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] for a malformed resource ID or
/// an event that does not fit the aggregate.
#[utoipa::path(
    post,
    path = "/api/v1/events",
    tag = "Events",
    summary = "Append an event",
    description = "Appends one event to the aggregate named by `resource_id`. The store assigns the version; the stored event is published to every live subscription.",
    request_body = AppendEventRequest,
    responses(
        (status = 201, description = "Event stored and published", body = EventDto),
        (status = 400, description = "Invalid resource ID or event", body = ErrorResponse),
        (status = 503, description = "Event store unavailable", body = ErrorResponse),
    )
)]
pub async fn append_event(
    State(state): State<AppState>,
    Json(req): Json<AppendEventRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let resource_id: ResourceId = req.resource_id.parse()?;
    let event = state.event_service.append(&resource_id, req.event).await?;
    Ok((StatusCode::CREATED, Json(EventDto::from(event))))
}

/// `PUT /owners/{owner}/devices/{device_id}`: Register a device.
///
/// # Errors
///
/// Returns [`GatewayError`] on store failures.
#[utoipa::path(
    put,
    path = "/api/v1/owners/{owner}/devices/{device_id}",
    tag = "Devices",
    summary = "Register a device to an owner",
    description = "Adds the device to the owner's device set and publishes a device_registered event. Idempotent.",
    params(
        ("owner" = String, Path, description = "Owner ID"),
        ("device_id" = String, Path, description = "Device ID"),
    ),
    responses(
        (status = 200, description = "Ownership state", body = OwnershipResponse),
    )
)]
pub async fn register_device(
    State(state): State<AppState>,
    Path((owner, device_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, GatewayError> {
    let event = state
        .event_service
        .register_device(&owner, &device_id)
        .await?;
    Ok(Json(OwnershipResponse::new(owner, device_id, event.as_ref())))
}

/// `DELETE /owners/{owner}/devices/{device_id}`: Unregister a device.
///
/// # Errors
///
/// Returns [`GatewayError::NotFound`] if the device is not registered to
/// the owner.
#[utoipa::path(
    delete,
    path = "/api/v1/owners/{owner}/devices/{device_id}",
    tag = "Devices",
    summary = "Unregister a device from an owner",
    description = "Removes the device from the owner's device set and publishes a device_unregistered event.",
    params(
        ("owner" = String, Path, description = "Owner ID"),
        ("device_id" = String, Path, description = "Device ID"),
    ),
    responses(
        (status = 200, description = "Ownership state", body = OwnershipResponse),
        (status = 404, description = "Device not registered", body = ErrorResponse),
    )
)]
pub async fn unregister_device(
    State(state): State<AppState>,
    Path((owner, device_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, GatewayError> {
    let event = state
        .event_service
        .unregister_device(&owner, &device_id)
        .await?;
    Ok(Json(OwnershipResponse::new(owner, device_id, Some(&event))))
}

/// `POST /pending-commands/cancel`: Cancel pending commands.
///
/// # Errors
///
/// Returns [`GatewayError::NotFound`] when the filter matches no open
/// command.
#[utoipa::path(
    post,
    path = "/api/v1/pending-commands/cancel",
    tag = "Events",
    summary = "Cancel pending commands",
    description = "Resolves the open commands of an aggregate whose correlation ID is listed (all of them for an empty list) with a canceled completion event.",
    request_body = CancelPendingRequest,
    responses(
        (status = 200, description = "Completions appended", body = CancelPendingResponse),
        (status = 404, description = "No matching pending command", body = ErrorResponse),
    )
)]
pub async fn cancel_pending_commands(
    State(state): State<AppState>,
    Json(req): Json<CancelPendingRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    let resource_id: ResourceId = req.resource_id.parse()?;
    let canceled = state
        .event_service
        .cancel_pending_commands(&resource_id, &req.correlation_ids)
        .await?;
    Ok(Json(CancelPendingResponse {
        canceled: canceled.into_iter().map(EventDto::from).collect(),
    }))
}

/// Ingestion routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/events", post(append_event))
        .route(
            "/owners/{owner}/devices/{device_id}",
            put(register_device).delete(unregister_device),
        )
        .route("/pending-commands/cancel", post(cancel_pending_commands))
}

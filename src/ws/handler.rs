//! Axum WebSocket upgrade handler.

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use tracing::warn;

use super::dispatcher::Dispatcher;
use super::messages::{ClientMessage, ServerMessage};
use crate::app_state::AppState;
use crate::error::GatewayError;
use crate::transport::websocket::server_halves;

/// `GET /ws`: Upgrade HTTP connection to a subscription stream.
///
/// The owner comes from the configured owner header, set by the
/// authenticating proxy in front of the gateway.
///
/// # Errors
///
/// Returns [`GatewayError::PermissionDenied`] when the owner header is
/// missing or empty.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, GatewayError> {
    let owner = headers
        .get(state.config.owner_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            GatewayError::PermissionDenied(format!(
                "missing {} header",
                state.config.owner_header
            ))
        })?
        .to_string();

    let dispatcher = Dispatcher::new(
        state.engine.clone(),
        owner,
        state.config.subscription_buffer_size,
    );
    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, source) = server_halves::<ClientMessage, ServerMessage>(socket);
        if let Err(err) = dispatcher.run(sink, source).await {
            warn!(error = %err, "stream ended with error");
        }
    }))
}

//! End-to-end tests: real router on an ephemeral port, driven over HTTP
//! and WebSocket.

#![allow(clippy::panic, clippy::indexing_slicing)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use ocf_event_gateway::app::build_app;
use ocf_event_gateway::app_state::AppState;
use ocf_event_gateway::client::{ChannelHandler, GatewayClient, HandlerEvent};
use ocf_event_gateway::config::GatewayConfig;
use ocf_event_gateway::domain::EventType;
use ocf_event_gateway::persistence::MemoryEventStore;
use ocf_event_gateway::subscription::SubscriptionRequest;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_gateway() -> SocketAddr {
    let config = GatewayConfig {
        projection_cache_ttl_secs: 0,
        ..GatewayConfig::default()
    };
    let state = AppState::new(Arc::new(MemoryEventStore::new()), config);
    let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
        panic!("bind failed");
    };
    let Ok(addr) = listener.local_addr() else {
        panic!("no local address");
    };
    tokio::spawn(async move {
        let _ = axum::serve(listener, build_app(state)).await;
    });
    addr
}

async fn post_event(http: &reqwest::Client, addr: SocketAddr, resource_id: &str, on: bool) -> Value {
    let body = json!({
        "resource_id": resource_id,
        "event": {
            "type": "resource_changed",
            "content": { "content_type": "application/json", "data": { "on": on } },
        },
    });
    let Ok(response) = http
        .post(format!("http://{addr}/api/v1/events"))
        .json(&body)
        .send()
        .await
    else {
        panic!("append request failed");
    };
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let Ok(event) = response.json::<Value>().await else {
        panic!("append response is not JSON");
    };
    event
}

async fn next(rx: &mut tokio::sync::mpsc::UnboundedReceiver<HandlerEvent>) -> HandlerEvent {
    let Ok(Some(event)) = tokio::time::timeout(TIMEOUT, rx.recv()).await else {
        panic!("handler saw nothing");
    };
    event
}

#[tokio::test]
async fn health_reports_version() {
    let addr = spawn_gateway().await;
    let Ok(response) = reqwest::get(format!("http://{addr}/health")).await else {
        panic!("health request failed");
    };
    assert!(response.status().is_success());
    let Ok(body) = response.json::<Value>().await else {
        panic!("health response is not JSON");
    };
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["store"], "memory");
}

#[tokio::test]
async fn malformed_resource_id_is_bad_request() {
    let addr = spawn_gateway().await;
    let Ok(response) = reqwest::Client::new()
        .post(format!("http://{addr}/api/v1/events"))
        .json(&json!({
            "resource_id": "no-href",
            "event": { "type": "resource_delete_pending", "correlation_id": "c1" },
        }))
        .send()
        .await
    else {
        panic!("request failed");
    };
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stream_requires_owner_header() {
    let addr = spawn_gateway().await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn catch_up_then_live_over_websocket() {
    let addr = spawn_gateway().await;
    let http = reqwest::Client::new();

    let Ok(response) = http
        .put(format!("http://{addr}/api/v1/owners/alice/devices/lamp"))
        .send()
        .await
    else {
        panic!("register request failed");
    };
    assert!(response.status().is_success());
    let first = post_event(&http, addr, "lamp/light", true).await;
    assert_eq!(first["version"], 1);

    let Ok(client) =
        GatewayClient::connect(&format!("ws://{addr}/ws"), "x-owner-id", "alice", TIMEOUT).await
    else {
        panic!("connect failed");
    };
    let (handler, mut rx) = ChannelHandler::channel();
    let request = SubscriptionRequest {
        resource_id_filter: vec!["lamp/light".into()],
        event_filter: vec![EventType::ResourceChanged],
        ..SubscriptionRequest::default()
    };
    let Ok(id) = client.subscribe(request, handler).await else {
        panic!("subscribe failed");
    };

    let HandlerEvent::Event(catch_up) = next(&mut rx).await else {
        panic!("expected the catch-up event");
    };
    assert_eq!((catch_up.subscription_id, catch_up.version), (id, 1));
    assert_eq!(catch_up.aggregate_id, "lamp/light");

    let second = post_event(&http, addr, "lamp/light", false).await;
    assert_eq!(second["version"], 2);
    let HandlerEvent::Event(live) = next(&mut rx).await else {
        panic!("expected the live event");
    };
    assert_eq!(live.version, 2);
    assert_eq!(live.event_type, EventType::ResourceChanged);

    let Ok(()) = client.cancel(id).await else {
        panic!("cancel failed");
    };
    assert!(matches!(next(&mut rx).await, HandlerEvent::Closed));
    client.close().await;
}

#[tokio::test]
async fn foreign_device_subscription_is_rejected() {
    let addr = spawn_gateway().await;
    let Ok(_) = reqwest::Client::new()
        .put(format!("http://{addr}/api/v1/owners/bob/devices/lamp"))
        .send()
        .await
    else {
        panic!("register request failed");
    };

    let Ok(client) =
        GatewayClient::connect(&format!("ws://{addr}/ws"), "x-owner-id", "alice", TIMEOUT).await
    else {
        panic!("connect failed");
    };
    let (handler, _rx) = ChannelHandler::channel();
    let request = SubscriptionRequest {
        device_id_filter: vec!["lamp".into()],
        ..SubscriptionRequest::default()
    };
    assert!(matches!(
        client.subscribe(request, handler).await,
        Err(ocf_event_gateway::error::GatewayError::NotFound(_))
    ));
    client.close().await;
}

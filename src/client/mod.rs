//! Duplex stream client.
//!
//! [`GatewayClient`] multiplexes any number of subscriptions over one
//! stream. Requests are correlated with acknowledgements through a
//! [`PendingOperations`] table; events are routed by subscription ID to the
//! [`EventHandler`] registered for it. A reader task owns the incoming half,
//! a writer task the outgoing half.

pub mod handler;
pub mod pending;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use handler::{ChannelHandler, EventHandler, HandlerEvent};
pub use pending::{PendingOperation, PendingOperations};

use crate::domain::{EventFilter, SubscriptionId};
use crate::error::{GatewayError, StatusCode};
use crate::subscription::{SubscriptionFilter, SubscriptionRequest};
use crate::transport::{MessageSink, MessageSource, websocket};
use crate::ws::messages::{ClientMessage, EventMessage, OperationStatus, ServerMessage};

const OUTBOUND_BUFFER: usize = 64;

/// Acknowledgement of one request.
#[derive(Debug, Clone)]
struct Ack {
    subscription_id: Option<SubscriptionId>,
    status: OperationStatus,
}

#[derive(Debug, Clone)]
struct Route {
    handler: Arc<dyn EventHandler>,
    capabilities: EventFilter,
}

#[derive(Debug, Default)]
struct Routes {
    /// Handlers of subscriptions awaiting their acknowledgement, by token.
    staged: HashMap<String, Route>,
    /// Tokens of create requests whose caller gave up waiting.
    abandoned: HashSet<String>,
    active: HashMap<SubscriptionId, Route>,
}

#[derive(Debug, Default)]
struct Shared {
    pending: PendingOperations<Ack>,
    routes: Mutex<Routes>,
}

impl Shared {
    fn routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Client side of a subscription stream.
#[derive(Debug)]
pub struct GatewayClient {
    out: mpsc::Sender<ClientMessage>,
    shared: Arc<Shared>,
    timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl GatewayClient {
    /// Starts a client over an established stream.
    ///
    /// `timeout` bounds how long each request waits for its
    /// acknowledgement.
    #[must_use]
    pub fn new<Snk, Src>(sink: Snk, source: Src, timeout: Duration) -> Self
    where
        Snk: MessageSink<ClientMessage> + 'static,
        Src: MessageSource<ServerMessage> + 'static,
    {
        let (out, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let shared = Arc::new(Shared::default());
        let writer = tokio::spawn(write_loop(sink, rx));
        let reader = tokio::spawn(read_loop(source, Arc::clone(&shared), out.downgrade()));
        Self {
            out,
            shared,
            timeout,
            reader,
            writer,
        }
    }

    /// Connects to a gateway WebSocket endpoint as `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] if the handshake fails.
    pub async fn connect(
        url: &str,
        owner_header: &str,
        owner: &str,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let (sink, source) = websocket::connect(url, owner_header, owner).await?;
        Ok(Self::new(sink, source, timeout))
    }

    /// Creates a subscription and routes its events to `handler`.
    ///
    /// The capability set is the request's effective event filter; any
    /// other event type delivered for this subscription is a protocol
    /// violation.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidSubscription`] for a filter no
    /// variant can serve, the server's rejection mapped back to a
    /// [`GatewayError`], or [`GatewayError::Timeout`].
    pub async fn subscribe(
        &self,
        request: SubscriptionRequest,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, GatewayError> {
        let capabilities = SubscriptionFilter::from_request(&request)?.events();
        let op = self.shared.pending.begin();
        let token = op.token().to_string();
        self.shared.routes().staged.insert(
            token.clone(),
            Route {
                handler,
                capabilities,
            },
        );

        let outcome = match self.send(ClientMessage::create(token.clone(), request)).await {
            Ok(()) => op.wait(self.timeout).await,
            Err(err) => Err(err),
        };
        let ack = match outcome {
            Ok(ack) => ack,
            Err(err) => {
                let mut routes = self.shared.routes();
                if routes.staged.remove(&token).is_some() {
                    routes.abandoned.insert(token);
                }
                return Err(err);
            }
        };
        if !ack.status.is_ok() {
            return Err(status_error(&ack.status));
        }
        ack.subscription_id.ok_or_else(|| {
            GatewayError::ProtocolViolation("acknowledgement without subscription id".to_string())
        })
    }

    /// Cancels a subscription. Its handler receives `on_close` before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection (unknown or already canceled
    /// subscription) or [`GatewayError::Timeout`].
    pub async fn cancel(&self, subscription_id: SubscriptionId) -> Result<(), GatewayError> {
        let op = self.shared.pending.begin();
        let token = op.token().to_string();
        self.send(ClientMessage::CancelSubscription {
            token,
            subscription_id,
        })
        .await?;
        let ack = op.wait(self.timeout).await?;
        if ack.status.is_ok() {
            Ok(())
        } else {
            Err(status_error(&ack.status))
        }
    }

    /// Number of subscriptions currently routed.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.shared.routes().active.len()
    }

    /// Closes the outgoing half and waits until the server has ended the
    /// stream. Every remaining handler receives `on_close`.
    pub async fn close(self) {
        drop(self.out);
        if let Err(err) = self.writer.await {
            warn!(error = %err, "client writer task failed");
        }
        if let Err(err) = self.reader.await {
            warn!(error = %err, "client reader task failed");
        }
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), GatewayError> {
        self.out
            .send(msg)
            .await
            .map_err(|_| GatewayError::Transport("stream closed".to_string()))
    }
}

/// Maps a rejection status back to an error.
fn status_error(status: &OperationStatus) -> GatewayError {
    let message = status.message.clone();
    match status.code {
        StatusCode::NotFound => GatewayError::NotFound(message),
        StatusCode::PermissionDenied => GatewayError::PermissionDenied(message),
        StatusCode::InvalidArgument => GatewayError::InvalidRequest(message),
        StatusCode::Unavailable => GatewayError::UpstreamUnavailable(message),
        StatusCode::Ok | StatusCode::Internal => GatewayError::Internal(message),
    }
}

async fn write_loop<Snk>(mut sink: Snk, mut rx: mpsc::Receiver<ClientMessage>)
where
    Snk: MessageSink<ClientMessage>,
{
    while let Some(msg) = rx.recv().await {
        if let Err(err) = sink.send(msg).await {
            debug!(error = %err, "client writer stopped");
            return;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<Src>(mut source: Src, shared: Arc<Shared>, out: mpsc::WeakSender<ClientMessage>)
where
    Src: MessageSource<ServerMessage>,
{
    let failure = loop {
        match source.recv().await {
            Ok(Some(msg)) => on_message(msg, &shared, &out).await,
            Ok(None) => break None,
            Err(GatewayError::InvalidRequest(reason)) => {
                warn!(%reason, "undecodable server frame skipped");
            }
            Err(err) => break Some(err),
        }
    };

    shared.pending.clear();
    let routes: Vec<Route> = {
        let mut routes = shared.routes();
        routes.staged.clear();
        routes.abandoned.clear();
        routes.active.drain().map(|(_, route)| route).collect()
    };
    for route in routes {
        match &failure {
            None => route.handler.on_close().await,
            Some(err) => route.handler.error(err.clone()).await,
        }
    }
    debug!(clean = failure.is_none(), "client stream ended");
}

async fn on_message(msg: ServerMessage, shared: &Shared, out: &mpsc::WeakSender<ClientMessage>) {
    match msg {
        ServerMessage::OperationProcessed {
            token,
            subscription_id,
            status,
        } => {
            let created = subscription_id.filter(|_| status.is_ok());
            let (staged, abandoned) = {
                let mut routes = shared.routes();
                (routes.staged.remove(&token), routes.abandoned.remove(&token))
            };
            let ack = Ack {
                subscription_id,
                status,
            };
            if let (Some(route), Some(id)) = (staged, created) {
                shared.routes().active.insert(id, route);
                if !shared.pending.complete(&token, ack) {
                    let orphaned = shared.routes().active.remove(&id).is_some();
                    if orphaned {
                        send_cancel(out, id).await;
                    }
                }
            } else {
                shared.pending.complete(&token, ack);
                if abandoned && let Some(id) = created {
                    debug!(subscription_id = %id, %token, "canceling abandoned subscription");
                    send_cancel(out, id).await;
                }
            }
        }
        ServerMessage::SubscriptionCanceled {
            subscription_id,
            reason,
        } => {
            let route = shared.routes().active.remove(&subscription_id);
            if let Some(route) = route {
                if reason.is_empty() {
                    route.handler.on_close().await;
                } else {
                    route.handler.error(GatewayError::Canceled(reason)).await;
                }
            }
        }
        ServerMessage::Event(event) => on_event(event, shared, out).await,
    }
}

async fn on_event(event: EventMessage, shared: &Shared, out: &mpsc::WeakSender<ClientMessage>) {
    let id = event.subscription_id;
    let route = shared.routes().active.get(&id).cloned();
    let Some(route) = route else {
        debug!(subscription_id = %id, "event for unknown subscription dropped");
        return;
    };

    let failure = if route.capabilities.contains(event.event_type) {
        route.handler.handle(event).await.err()
    } else {
        Some(GatewayError::ProtocolViolation(format!(
            "subscription {id} received undeclared event type {}",
            event.event_type
        )))
    };

    if let Some(err) = failure {
        warn!(subscription_id = %id, error = %err, "canceling subscription");
        let removed = shared.routes().active.remove(&id).is_some();
        if removed {
            send_cancel(out, id).await;
            route.handler.error(err).await;
        }
    }
}

async fn send_cancel(out: &mpsc::WeakSender<ClientMessage>, subscription_id: SubscriptionId) {
    if let Some(out) = out.upgrade() {
        let _ = out
            .send(ClientMessage::CancelSubscription {
                token: String::new(),
                subscription_id,
            })
            .await;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::domain::{
        CommandStatus, Content, EventBus, EventKind, EventType, ResourceId, ResourceLink,
    };
    use crate::persistence::{EventStore, MemoryEventStore};
    use crate::projection::Projection;
    use crate::service::EventService;
    use crate::subscription::SubscriptionEngine;
    use crate::transport::{self, ChannelSink, ChannelSource};
    use crate::ws::dispatcher::Dispatcher;

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct Setup {
        client: GatewayClient,
        service: EventService,
        projection: Projection,
        server: JoinHandle<Result<(), GatewayError>>,
    }

    async fn setup() -> Setup {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let bus = EventBus::new(64);
        let projection = Projection::spawn(Arc::clone(&store), bus.clone(), Duration::ZERO);
        let engine = SubscriptionEngine::new(
            projection.clone(),
            bus.clone(),
            Arc::clone(&store),
            Duration::from_secs(60),
            64,
        );
        let service = EventService::new(store, bus);
        let Ok(_) = service.register_device("alice", "d").await else {
            panic!("register failed");
        };

        let (client_sink, server_source) = transport::channel(16);
        let (server_sink, client_source) = transport::channel(64);
        let server = tokio::spawn(Dispatcher::new(engine, "alice", 64).run(server_sink, server_source));
        let client = GatewayClient::new(client_sink, client_source, TIMEOUT);
        Setup {
            client,
            service,
            projection,
            server,
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<HandlerEvent>) -> HandlerEvent {
        let Ok(Some(event)) = tokio::time::timeout(TIMEOUT, rx.recv()).await else {
            panic!("handler saw nothing");
        };
        event
    }

    fn device(events: &[EventType]) -> SubscriptionRequest {
        SubscriptionRequest {
            device_id_filter: vec!["d".into()],
            event_filter: events.to_vec(),
            ..SubscriptionRequest::default()
        }
    }

    #[tokio::test]
    async fn handler_only_sees_declared_types() {
        let s = setup().await;
        let (handler, mut rx) = ChannelHandler::channel();
        let Ok(_id) = s
            .client
            .subscribe(device(&[EventType::ResourcePublished]), handler)
            .await
        else {
            panic!("subscribe failed");
        };

        let light = ResourceId::new("d", "/light");
        let changed = EventKind::ResourceChanged {
            content: Content::json(serde_json::json!({ "on": true })),
            status: CommandStatus::Ok,
        };
        let published = EventKind::ResourceLinksPublished {
            links: vec![ResourceLink {
                href: "/light".into(),
                resource_types: vec!["oic.r.switch.binary".into()],
                interfaces: vec![],
            }],
        };
        for (resource_id, kind) in [(light, changed), (ResourceId::links("d"), published)] {
            let Ok(_) = s.service.append(&resource_id, kind).await else {
                panic!("append failed");
            };
        }

        let HandlerEvent::Event(event) = next(&mut rx).await else {
            panic!("expected the published event");
        };
        assert_eq!(event.event_type, EventType::ResourcePublished);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn cancel_closes_handler_and_releases_device() {
        let s = setup().await;
        let (handler, mut rx) = ChannelHandler::channel();
        let Ok(id) = s.client.subscribe(device(&[]), handler).await else {
            panic!("subscribe failed");
        };
        assert_eq!(s.client.subscriptions(), 1);
        assert!(matches!(s.projection.ref_count("d").await, Ok(Some(1))));

        let Ok(()) = s.client.cancel(id).await else {
            panic!("cancel failed");
        };
        assert!(matches!(next(&mut rx).await, HandlerEvent::Closed));
        assert_eq!(s.client.subscriptions(), 0);
        assert!(matches!(s.projection.ref_count("d").await, Ok(None)));
        assert!(matches!(
            s.client.cancel(id).await,
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn rejected_subscription_surfaces_server_status() {
        let s = setup().await;
        let (handler, _rx) = ChannelHandler::channel();
        let request = SubscriptionRequest {
            device_id_filter: vec!["not-mine".into()],
            ..SubscriptionRequest::default()
        };
        assert!(matches!(
            s.client.subscribe(request, handler).await,
            Err(GatewayError::NotFound(_))
        ));
        assert_eq!(s.client.subscriptions(), 0);
    }

    #[tokio::test]
    async fn close_ends_every_subscription_cleanly() {
        let s = setup().await;
        let (first, mut first_rx) = ChannelHandler::channel();
        let (second, mut second_rx) = ChannelHandler::channel();
        let Ok(_) = s.client.subscribe(device(&[]), first).await else {
            panic!("subscribe failed");
        };
        let Ok(_) = s.client.subscribe(device(&[]), second).await else {
            panic!("subscribe failed");
        };
        assert!(matches!(s.projection.ref_count("d").await, Ok(Some(2))));

        s.client.close().await;
        assert!(matches!(next(&mut first_rx).await, HandlerEvent::Closed));
        assert!(matches!(next(&mut second_rx).await, HandlerEvent::Closed));
        let Ok(Ok(Ok(()))) = tokio::time::timeout(TIMEOUT, s.server).await else {
            panic!("server did not finish cleanly");
        };
        assert!(matches!(s.projection.ref_count("d").await, Ok(None)));
        assert!(first_rx.recv().await.is_none());
    }

    /// Client against a scripted server.
    fn scripted() -> (
        GatewayClient,
        ChannelSink<ServerMessage>,
        ChannelSource<ClientMessage>,
    ) {
        let (client_sink, server_source) = transport::channel(16);
        let (server_sink, client_source) = transport::channel(16);
        (
            GatewayClient::new(client_sink, client_source, TIMEOUT),
            server_sink,
            server_source,
        )
    }

    async fn accept(
        server_sink: &mut ChannelSink<ServerMessage>,
        server_source: &mut ChannelSource<ClientMessage>,
    ) -> SubscriptionId {
        let Ok(Some(ClientMessage::CreateSubscription { token, .. })) = server_source.recv().await
        else {
            panic!("expected a create request");
        };
        let id = SubscriptionId::new();
        let Ok(()) = server_sink
            .send(ServerMessage::OperationProcessed {
                token,
                subscription_id: Some(id),
                status: OperationStatus::ok(),
            })
            .await
        else {
            panic!("client gone");
        };
        id
    }

    #[tokio::test]
    async fn undeclared_type_cancels_with_protocol_violation() {
        let (client, mut server_sink, mut server_source) = scripted();
        let (handler, mut rx) = ChannelHandler::channel();
        let subscribe = client.subscribe(device(&[EventType::ResourceChanged]), handler);
        let (id, accepted) = tokio::join!(subscribe, accept(&mut server_sink, &mut server_source));
        let Ok(id) = id else {
            panic!("subscribe failed");
        };
        assert_eq!(id, accepted);

        let Ok(()) = server_sink
            .send(ServerMessage::Event(EventMessage {
                subscription_id: id,
                correlation_id: String::new(),
                aggregate_id: "d/device-status".into(),
                event_type: EventType::DeviceOnline,
                payload: serde_json::json!({}),
                version: 3,
                timestamp: chrono::Utc::now(),
            }))
            .await
        else {
            panic!("client gone");
        };

        assert!(matches!(
            next(&mut rx).await,
            HandlerEvent::Error(GatewayError::ProtocolViolation(_))
        ));
        assert!(matches!(
            server_source.recv().await,
            Ok(Some(ClientMessage::CancelSubscription { subscription_id, .. })) if subscription_id == id
        ));
        assert_eq!(client.subscriptions(), 0);
    }

    #[tokio::test]
    async fn server_reason_and_transport_failure_are_errors() {
        let (client, mut server_sink, mut server_source) = scripted();
        let (first, mut first_rx) = ChannelHandler::channel();
        let (second, mut second_rx) = ChannelHandler::channel();

        let (id, _) = tokio::join!(
            client.subscribe(device(&[]), first),
            accept(&mut server_sink, &mut server_source)
        );
        let Ok(id) = id else {
            panic!("subscribe failed");
        };
        let (other, _) = tokio::join!(
            client.subscribe(device(&[]), second),
            accept(&mut server_sink, &mut server_source)
        );
        let Ok(_) = other else {
            panic!("subscribe failed");
        };

        let Ok(()) = server_sink
            .send(ServerMessage::SubscriptionCanceled {
                subscription_id: id,
                reason: "device gone".into(),
            })
            .await
        else {
            panic!("client gone");
        };
        assert!(matches!(
            next(&mut first_rx).await,
            HandlerEvent::Error(GatewayError::Canceled(reason)) if reason == "device gone"
        ));

        server_sink
            .fail(GatewayError::Transport("connection reset".into()))
            .await;
        assert!(matches!(
            next(&mut second_rx).await,
            HandlerEvent::Error(GatewayError::Transport(_))
        ));
        assert!(first_rx.recv().await.is_none());
    }
}

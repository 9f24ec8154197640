//! Per-stream dispatcher and subscription registry.
//!
//! One [`Dispatcher`] serves one duplex stream for one owner. It reads
//! control messages, creates and cancels subscriptions, and funnels every
//! outbound frame through a single writer task, since the transport
//! tolerates only one writer.
//!
//! Stream state: `Open → Active → Closing → Closed`. `Closing` is entered on
//! end of stream or a transport error and cancels every subscription before
//! `Closed`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::messages::{ClientMessage, OperationStatus, ServerMessage};
use crate::domain::SubscriptionId;
use crate::error::GatewayError;
use crate::subscription::{
    SubscriptionClosed, SubscriptionEngine, SubscriptionHandle, SubscriptionRequest,
};
use crate::transport::{MessageSink, MessageSource};

/// Stream lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Stream accepted, no subscription created yet.
    Open,
    /// At least one subscription was created.
    Active,
    /// Tearing down every subscription.
    Closing,
    /// Terminal.
    Closed,
}

/// Callbacks fired when a subscription on the stream ends.
pub trait StreamObserver: Send + Sync + fmt::Debug {
    /// Subscription ended cleanly.
    fn on_close(&self, id: SubscriptionId) {
        debug!(subscription_id = %id, "subscription closed");
    }

    /// Subscription ended abnormally, or a request about it failed.
    fn on_error(&self, id: SubscriptionId, err: &GatewayError) {
        warn!(subscription_id = %id, error = %err, "subscription error");
    }
}

/// Observer that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StreamObserver for TracingObserver {}

/// Dispatcher of one stream.
#[derive(Debug)]
pub struct Dispatcher {
    engine: SubscriptionEngine,
    owner: String,
    buffer: usize,
    observer: Arc<dyn StreamObserver>,
    state: watch::Sender<DispatcherState>,
    registry: HashMap<SubscriptionId, SubscriptionHandle>,
    canceled: HashSet<SubscriptionId>,
}

impl Dispatcher {
    /// Creates a dispatcher for `owner`'s stream.
    #[must_use]
    pub fn new(engine: SubscriptionEngine, owner: impl Into<String>, buffer: usize) -> Self {
        let (state, _) = watch::channel(DispatcherState::Open);
        Self {
            engine,
            owner: owner.into(),
            buffer: buffer.max(1),
            observer: Arc::new(TracingObserver),
            state,
            registry: HashMap::new(),
            canceled: HashSet::new(),
        }
    }

    /// Replaces the default logging observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Watches the stream state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    /// Serves the stream until end of stream or transport failure.
    ///
    /// # Errors
    ///
    /// Returns the transport error that ended the stream. Every
    /// subscription has been torn down either way.
    pub async fn run<Snk, Src>(mut self, sink: Snk, mut source: Src) -> Result<(), GatewayError>
    where
        Snk: MessageSink<ServerMessage> + 'static,
        Src: MessageSource<ClientMessage>,
    {
        let (out_tx, out_rx) = mpsc::channel(self.buffer);
        let writer = tokio::spawn(write_loop(sink, out_rx));
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        info!(owner = %self.owner, "stream opened");

        let outcome = loop {
            tokio::select! {
                biased;
                Some(closed) = closed_rx.recv() => {
                    self.on_subscription_closed(closed, &out_tx).await;
                }
                msg = source.recv() => match msg {
                    Ok(Some(msg)) => self.handle(msg, &out_tx, &closed_tx).await,
                    Ok(None) => break Ok(()),
                    Err(GatewayError::InvalidRequest(reason)) => {
                        let err = GatewayError::InvalidRequest(reason);
                        warn!(owner = %self.owner, error = %err, "malformed client message");
                        let _ = out_tx
                            .send(ServerMessage::OperationProcessed {
                                token: String::new(),
                                subscription_id: None,
                                status: OperationStatus::from_error(&err),
                            })
                            .await;
                    }
                    Err(err) => break Err(err),
                },
            }
        };

        self.teardown(outcome.as_ref().err(), &mut closed_rx).await;
        drop(out_tx);
        drop(closed_tx);
        if let Err(err) = writer.await {
            warn!(error = %err, "stream writer task failed");
        }
        self.state.send_replace(DispatcherState::Closed);
        info!(owner = %self.owner, clean = outcome.is_ok(), "stream closed");
        outcome
    }

    async fn handle(
        &mut self,
        msg: ClientMessage,
        out: &mpsc::Sender<ServerMessage>,
        closed: &mpsc::UnboundedSender<SubscriptionClosed>,
    ) {
        match msg {
            ClientMessage::CreateSubscription {
                token,
                device_id_filter,
                resource_id_filter,
                event_filter,
            } => {
                let request = SubscriptionRequest {
                    device_id_filter,
                    resource_id_filter,
                    event_filter,
                };
                self.create(token, &request, out, closed).await;
            }
            ClientMessage::CancelSubscription {
                token,
                subscription_id,
            } => self.cancel(token, subscription_id, out).await,
        }
    }

    async fn create(
        &mut self,
        token: String,
        request: &SubscriptionRequest,
        out: &mpsc::Sender<ServerMessage>,
        closed: &mpsc::UnboundedSender<SubscriptionClosed>,
    ) {
        let created = match self.engine.create(&self.owner, request, out.clone()) {
            Ok(mut subscription) => match subscription.init().await {
                Ok(()) => Ok(subscription),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        match created {
            Ok(subscription) => {
                let id = subscription.id();
                let _ = out
                    .send(ServerMessage::OperationProcessed {
                        token,
                        subscription_id: Some(id),
                        status: OperationStatus::ok(),
                    })
                    .await;
                self.registry.insert(id, subscription.start(closed.clone()));
                if *self.state.borrow() == DispatcherState::Open {
                    self.state.send_replace(DispatcherState::Active);
                }
                info!(owner = %self.owner, subscription_id = %id, "subscription created");
            }
            Err(err) => {
                warn!(owner = %self.owner, %token, error = %err, "subscription rejected");
                let _ = out
                    .send(ServerMessage::OperationProcessed {
                        token,
                        subscription_id: None,
                        status: OperationStatus::from_error(&err),
                    })
                    .await;
            }
        }
    }

    async fn cancel(&mut self, token: String, id: SubscriptionId, out: &mpsc::Sender<ServerMessage>) {
        let Some(handle) = self.registry.get(&id) else {
            let err = if self.canceled.contains(&id) {
                warn!(subscription_id = %id, "subscription already canceled");
                GatewayError::DuplicateOperation(format!("subscription {id} already canceled"))
            } else {
                let err = GatewayError::NotFound(format!("subscription {id}"));
                self.observer.on_error(id, &err);
                err
            };
            let _ = out
                .send(ServerMessage::OperationProcessed {
                    token,
                    subscription_id: Some(id),
                    status: OperationStatus::from_error(&err),
                })
                .await;
            return;
        };

        let wait = handle.cancel();
        let initiated = wait.initiated();
        wait.wait().await;
        if !initiated {
            // Lost the race against a self-cancel; its notification follows.
            let err = GatewayError::DuplicateOperation(format!("subscription {id} already canceled"));
            warn!(subscription_id = %id, "cancel raced with subscription failure");
            let _ = out
                .send(ServerMessage::OperationProcessed {
                    token,
                    subscription_id: Some(id),
                    status: OperationStatus::from_error(&err),
                })
                .await;
            return;
        }

        self.registry.remove(&id);
        self.canceled.insert(id);
        let _ = out
            .send(ServerMessage::SubscriptionCanceled {
                subscription_id: id,
                reason: String::new(),
            })
            .await;
        let _ = out
            .send(ServerMessage::OperationProcessed {
                token,
                subscription_id: Some(id),
                status: OperationStatus::ok(),
            })
            .await;
        self.observer.on_close(id);
        info!(subscription_id = %id, "subscription canceled by client");
    }

    async fn on_subscription_closed(
        &mut self,
        closed: SubscriptionClosed,
        out: &mpsc::Sender<ServerMessage>,
    ) {
        if self.registry.remove(&closed.id).is_none() {
            return;
        }
        self.canceled.insert(closed.id);
        let _ = out
            .send(ServerMessage::SubscriptionCanceled {
                subscription_id: closed.id,
                reason: closed.error.to_string(),
            })
            .await;
        self.observer.on_error(closed.id, &closed.error);
    }

    /// Cancels every remaining subscription. One that already canceled
    /// itself keeps its own error, even if the stream ended before its
    /// notification was handled.
    async fn teardown(
        &mut self,
        error: Option<&GatewayError>,
        closed_rx: &mut mpsc::UnboundedReceiver<SubscriptionClosed>,
    ) {
        self.state.send_replace(DispatcherState::Closing);
        let handles: Vec<SubscriptionHandle> =
            self.registry.drain().map(|(_, handle)| handle).collect();
        debug!(owner = %self.owner, subscriptions = handles.len(), "closing stream");
        let mut ended = Vec::with_capacity(handles.len());
        for handle in handles {
            handle.cancel().wait().await;
            self.canceled.insert(handle.id());
            ended.push(handle.id());
        }

        // A self-cancel is queued before its subscription reports Canceled.
        let mut self_closed = HashMap::new();
        while let Ok(closed) = closed_rx.try_recv() {
            self_closed.insert(closed.id, closed.error);
        }
        for id in ended {
            match (self_closed.remove(&id), error) {
                (Some(own), _) => self.observer.on_error(id, &own),
                (None, None) => self.observer.on_close(id),
                (None, Some(err)) => self.observer.on_error(id, err),
            }
        }
    }
}

async fn write_loop<Snk>(mut sink: Snk, mut rx: mpsc::Receiver<ServerMessage>)
where
    Snk: MessageSink<ServerMessage>,
{
    while let Some(msg) = rx.recv().await {
        if let Err(err) = sink.send(msg).await {
            debug!(error = %err, "stream writer stopped");
            return;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::domain::{CommandStatus, Content, EventBus, EventKind, EventType, ResourceId};
    use crate::error::StatusCode;
    use crate::persistence::{EventStore, MemoryEventStore};
    use crate::projection::Projection;
    use crate::subscription::SubscriptionState;
    use crate::transport::{self, ChannelSink, ChannelSource};

    #[derive(Debug, Default)]
    struct Recorder {
        closes: Mutex<Vec<SubscriptionId>>,
        errors: Mutex<Vec<(SubscriptionId, StatusCode)>>,
    }

    impl StreamObserver for Recorder {
        fn on_close(&self, id: SubscriptionId) {
            if let Ok(mut closes) = self.closes.lock() {
                closes.push(id);
            }
        }

        fn on_error(&self, id: SubscriptionId, err: &GatewayError) {
            if let Ok(mut errors) = self.errors.lock() {
                errors.push((id, err.status()));
            }
        }
    }

    impl Recorder {
        fn closes(&self) -> Vec<SubscriptionId> {
            self.closes.lock().map(|c| c.clone()).unwrap_or_default()
        }

        fn errors(&self) -> Vec<(SubscriptionId, StatusCode)> {
            self.errors.lock().map(|e| e.clone()).unwrap_or_default()
        }
    }

    struct Harness {
        projection: Projection,
        to_server: ChannelSink<ClientMessage>,
        from_server: ChannelSource<ServerMessage>,
        recorder: Arc<Recorder>,
        task: tokio::task::JoinHandle<Result<(), GatewayError>>,
        state: watch::Receiver<DispatcherState>,
    }

    async fn harness(devices: &[(&str, &[&str])]) -> Harness {
        let store = Arc::new(MemoryEventStore::new());
        for (device_id, hrefs) in devices {
            let Ok(_) = store.register_device("alice", device_id).await else {
                panic!("register device failed");
            };
            for href in *hrefs {
                let kind = EventKind::ResourceChanged {
                    content: Content::json(serde_json::json!({ "on": true })),
                    status: CommandStatus::Ok,
                };
                let Ok(_) = store.append(&ResourceId::new(*device_id, *href), kind).await else {
                    panic!("append failed");
                };
            }
        }
        let bus = EventBus::new(64);
        let projection = Projection::spawn(
            Arc::clone(&store) as Arc<dyn EventStore>,
            bus.clone(),
            Duration::ZERO,
        );
        let engine = SubscriptionEngine::new(
            projection.clone(),
            bus,
            store as Arc<dyn EventStore>,
            Duration::from_secs(60),
            64,
        );
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(engine, "alice", 64)
            .with_observer(Arc::clone(&recorder) as Arc<dyn StreamObserver>);
        let state = dispatcher.state();
        let (to_server, server_source) = transport::channel(16);
        let (server_sink, from_server) = transport::channel(64);
        let task = tokio::spawn(dispatcher.run(server_sink, server_source));
        Harness {
            projection,
            to_server,
            from_server,
            recorder,
            task,
            state,
        }
    }

    impl Harness {
        async fn send(&mut self, msg: ClientMessage) {
            let Ok(()) = self.to_server.send(msg).await else {
                panic!("dispatcher gone");
            };
        }

        async fn next(&mut self) -> ServerMessage {
            let Ok(Ok(Some(msg))) =
                tokio::time::timeout(Duration::from_secs(2), self.from_server.recv()).await
            else {
                panic!("expected a server frame");
            };
            msg
        }

        async fn create(&mut self, token: &str, devices: &[&str]) -> SubscriptionId {
            self.send(ClientMessage::create(
                token,
                SubscriptionRequest {
                    device_id_filter: devices.iter().map(|d| (*d).to_string()).collect(),
                    ..SubscriptionRequest::default()
                },
            ))
            .await;
            let ServerMessage::OperationProcessed {
                token: acked,
                subscription_id: Some(id),
                status,
            } = self.next().await
            else {
                panic!("expected an acknowledgement");
            };
            assert_eq!(acked, token);
            assert!(status.is_ok());
            id
        }
    }

    #[tokio::test]
    async fn create_acks_then_bursts_then_client_cancel() {
        let mut h = harness(&[("d", &["/light"])]).await;
        let id = h.create("t1", &["d"]).await;

        let ServerMessage::Event(event) = h.next().await else {
            panic!("expected catch-up event");
        };
        assert_eq!(event.subscription_id, id);
        assert_eq!(event.event_type, EventType::ResourceChanged);
        assert_eq!(*h.state.borrow(), DispatcherState::Active);

        h.send(ClientMessage::CancelSubscription {
            token: "t2".into(),
            subscription_id: id,
        })
        .await;
        assert!(matches!(
            h.next().await,
            ServerMessage::SubscriptionCanceled { reason, .. } if reason.is_empty()
        ));
        assert!(matches!(
            h.next().await,
            ServerMessage::OperationProcessed { token, status, .. } if token == "t2" && status.is_ok()
        ));
        assert!(matches!(h.projection.ref_count("d").await, Ok(None)));
        assert_eq!(h.recorder.closes(), vec![id]);
    }

    #[tokio::test]
    async fn invalid_filter_is_rejected_without_side_effects() {
        let mut h = harness(&[("d", &["/light"])]).await;
        h.send(ClientMessage::create(
            "bad",
            SubscriptionRequest {
                resource_id_filter: vec!["d/light".into()],
                event_filter: vec![EventType::DeviceRegistered],
                ..SubscriptionRequest::default()
            },
        ))
        .await;
        let ServerMessage::OperationProcessed {
            subscription_id,
            status,
            ..
        } = h.next().await
        else {
            panic!("expected an acknowledgement");
        };
        assert!(subscription_id.is_none());
        assert_eq!(status.code, StatusCode::InvalidArgument);
        assert!(matches!(h.projection.ref_count("d").await, Ok(None)));
        assert_eq!(*h.state.borrow(), DispatcherState::Open);
    }

    #[tokio::test]
    async fn unknown_and_repeated_cancels_are_local_errors() {
        let mut h = harness(&[("d", &["/light"])]).await;
        let unknown = SubscriptionId::new();
        h.send(ClientMessage::CancelSubscription {
            token: "x".into(),
            subscription_id: unknown,
        })
        .await;
        assert!(matches!(
            h.next().await,
            ServerMessage::OperationProcessed { status, .. } if status.code == StatusCode::NotFound
        ));
        assert_eq!(h.recorder.errors(), vec![(unknown, StatusCode::NotFound)]);

        let id = h.create("t1", &["d"]).await;
        let _burst = h.next().await;
        for token in ["c1", "c2"] {
            h.send(ClientMessage::CancelSubscription {
                token: token.into(),
                subscription_id: id,
            })
            .await;
        }
        assert!(matches!(h.next().await, ServerMessage::SubscriptionCanceled { .. }));
        assert!(matches!(
            h.next().await,
            ServerMessage::OperationProcessed { status, .. } if status.is_ok()
        ));
        assert!(matches!(
            h.next().await,
            ServerMessage::OperationProcessed { status, .. }
                if status.code == StatusCode::InvalidArgument
        ));
        // Stream still usable.
        let _second = h.create("t3", &["d"]).await;
    }

    #[tokio::test]
    async fn end_of_stream_closes_every_subscription_once() {
        let mut h = harness(&[("a", &["/x"]), ("b", &["/y"])]).await;
        let first = h.create("t1", &["a"]).await;
        let _ = h.next().await;
        let second = h.create("t2", &["a", "b"]).await;
        let _ = h.next().await;
        let _ = h.next().await;
        assert!(matches!(h.projection.ref_count("a").await, Ok(Some(2))));

        let Ok(()) = h.to_server.close().await else {
            panic!("close failed");
        };
        let Ok(Ok(Ok(()))) = tokio::time::timeout(Duration::from_secs(2), h.task).await else {
            panic!("dispatcher did not finish cleanly");
        };

        let mut closes = h.recorder.closes();
        closes.sort_by_key(|id| id.to_string());
        let mut expected = vec![first, second];
        expected.sort_by_key(|id| id.to_string());
        assert_eq!(closes, expected);
        assert!(h.recorder.errors().is_empty());
        assert!(matches!(h.projection.ref_count("a").await, Ok(None)));
        assert!(matches!(h.projection.ref_count("b").await, Ok(None)));
        assert_eq!(*h.state.borrow(), DispatcherState::Closed);
    }

    #[tokio::test]
    async fn transport_error_reports_error_for_each() {
        let mut h = harness(&[("d", &["/light"])]).await;
        let id = h.create("t1", &["d"]).await;
        h.to_server
            .fail(GatewayError::Transport("connection reset".into()))
            .await;
        let Ok(Ok(Err(GatewayError::Transport(_)))) =
            tokio::time::timeout(Duration::from_secs(2), h.task).await
        else {
            panic!("dispatcher should end with the transport error");
        };
        assert_eq!(h.recorder.errors(), vec![(id, StatusCode::Unavailable)]);
        assert!(h.recorder.closes().is_empty());
    }

    #[tokio::test]
    async fn self_cancel_pending_at_end_of_stream_stays_an_error() {
        let store = Arc::new(MemoryEventStore::new());
        let Ok(_) = store.register_device("alice", "d").await else {
            panic!("register device failed");
        };
        let bus = EventBus::new(64);
        let projection = Projection::spawn(
            Arc::clone(&store) as Arc<dyn EventStore>,
            bus.clone(),
            Duration::ZERO,
        );
        let engine = SubscriptionEngine::new(
            projection,
            bus.clone(),
            Arc::clone(&store) as Arc<dyn EventStore>,
            Duration::from_secs(60),
            64,
        );
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = Dispatcher::new(engine.clone(), "alice", 8)
            .with_observer(Arc::clone(&recorder) as Arc<dyn StreamObserver>);

        let (out_tx, _out_rx) = mpsc::channel(8);
        let request = SubscriptionRequest {
            device_id_filter: vec!["d".into()],
            ..SubscriptionRequest::default()
        };
        let Ok(mut sub) = engine.create("alice", &request, out_tx) else {
            panic!("valid subscription");
        };
        let Ok(()) = sub.init().await else {
            panic!("init failed");
        };
        let id = sub.id();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let handle = sub.start(closed_tx);

        let Ok(Some(removed)) = store.unregister_device("alice", "d").await else {
            panic!("unregister failed");
        };
        bus.publish_owner(removed);
        for _ in 0..100 {
            if handle.state() == SubscriptionState::Canceled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handle.state(), SubscriptionState::Canceled);
        dispatcher.registry.insert(id, handle);

        dispatcher.teardown(None, &mut closed_rx).await;
        assert_eq!(recorder.errors(), vec![(id, StatusCode::NotFound)]);
        assert!(recorder.closes().is_empty());
    }
}

//! WebSocket adapters: JSON text frames over axum (server) and
//! tokio-tungstenite (client) sockets.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as ClientFrame;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{MessageSink, MessageSource};
use crate::error::GatewayError;

fn transport(err: impl fmt::Display) -> GatewayError {
    GatewayError::Transport(err.to_string())
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T, GatewayError> {
    serde_json::from_str(text).map_err(|e| GatewayError::InvalidRequest(format!("bad frame: {e}")))
}

/// Splits an upgraded server socket into typed halves.
#[must_use]
pub fn server_halves<In, Out>(socket: WebSocket) -> (ServerSink<Out>, ServerSource<In>) {
    let (tx, rx) = socket.split();
    (
        ServerSink {
            inner: tx,
            _marker: PhantomData,
        },
        ServerSource {
            inner: rx,
            _marker: PhantomData,
        },
    )
}

/// Server-side sink writing JSON text frames.
pub struct ServerSink<T> {
    inner: SplitSink<WebSocket, Message>,
    _marker: PhantomData<fn(T)>,
}

impl<T> fmt::Debug for ServerSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: Serialize + Send + 'static> MessageSink<T> for ServerSink<T> {
    async fn send(&mut self, msg: T) -> Result<(), GatewayError> {
        let json = serde_json::to_string(&msg)?;
        self.inner.send(Message::text(json)).await.map_err(transport)
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        self.inner.close().await.map_err(transport)
    }
}

/// Server-side source reading JSON text frames.
pub struct ServerSource<T> {
    inner: SplitStream<WebSocket>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for ServerSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> MessageSource<T> for ServerSource<T> {
    async fn recv(&mut self) -> Result<Option<T>, GatewayError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return decode(text.as_str()).map(Some),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(transport(e)),
            }
        }
    }
}

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a gateway stream endpoint as `owner`.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] for a malformed URL or owner and
/// [`GatewayError::Transport`] if the handshake fails.
pub async fn connect<In, Out>(
    url: &str,
    owner_header: &str,
    owner: &str,
) -> Result<(ClientSink<Out>, ClientSource<In>), GatewayError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
    let value =
        HeaderValue::from_str(owner).map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
    let name = tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(owner_header.as_bytes())
        .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
    request.headers_mut().insert(name, value);

    let (stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(transport)?;
    let (tx, rx) = stream.split();
    Ok((
        ClientSink {
            inner: tx,
            _marker: PhantomData,
        },
        ClientSource {
            inner: rx,
            _marker: PhantomData,
        },
    ))
}

/// Client-side sink writing JSON text frames.
pub struct ClientSink<T> {
    inner: SplitSink<ClientStream, ClientFrame>,
    _marker: PhantomData<fn(T)>,
}

impl<T> fmt::Debug for ClientSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: Serialize + Send + 'static> MessageSink<T> for ClientSink<T> {
    async fn send(&mut self, msg: T) -> Result<(), GatewayError> {
        let json = serde_json::to_string(&msg)?;
        self.inner
            .send(ClientFrame::text(json))
            .await
            .map_err(transport)
    }

    async fn close(&mut self) -> Result<(), GatewayError> {
        self.inner.close().await.map_err(transport)
    }
}

/// Client-side source reading JSON text frames.
pub struct ClientSource<T> {
    inner: SplitStream<ClientStream>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for ClientSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSource").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> MessageSource<T> for ClientSource<T> {
    async fn recv(&mut self) -> Result<Option<T>, GatewayError> {
        loop {
            match self.inner.next().await {
                Some(Ok(ClientFrame::Text(text))) => return decode(text.as_str()).map(Some),
                Some(Ok(ClientFrame::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(transport(e)),
            }
        }
    }
}

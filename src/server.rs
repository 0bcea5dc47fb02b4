//! WebSocket transport shim and operator read endpoints
//!
//! The thin shell between the network and the core: `/ws` upgrades a
//! connection and hands the socket to a session actor; `/healthz` and
//! `/stats` are the minimal read-only operator surface. Everything else
//! (submission API, auth, dashboards) belongs to external collaborators.

use crate::hub::Hub;
use crate::session::{AgentSession, FrameTransport, SessionContext, TransportError};
use async_trait::async_trait;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared state for the transport routes
#[derive(Clone)]
pub struct AppState {
    hub: Arc<Hub>,
}

/// Builds the transport router over a running hub
#[must_use]
pub fn create_router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .route("/stats", get(stats))
        .with_state(AppState { hub })
}

/// Binds the listener, letting the OS pick when port 0 is requested
///
/// # Errors
/// I/O errors from bind.
pub async fn bind(addr: &str) -> std::io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(%local, "transport listening");
    Ok((listener, local))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let ctx: SessionContext = state.hub.session_context();
    ws.on_upgrade(move |socket| async move {
        let transport = WsTransport::new(socket);
        let _ = AgentSession::spawn(ctx, transport).await;
    })
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.hub.snapshot().await {
        Ok((queue, agents)) => Json(json!({
            "queue": queue,
            "agents": agents,
            "sessions": state.hub.sessions().len(),
        }))
        .into_response(),
        Err(e) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// `FrameTransport` over an upgraded WebSocket
pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    /// Wraps an upgraded socket
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.socket
            .send(Message::Text(Utf8Bytes::from(text)))
            .await
            .map_err(|e| TransportError::new(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => {
                    return Some(match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => Ok(text),
                        Err(_) => Err(TransportError::new("non-utf8 binary frame")),
                    });
                }
                Ok(Message::Close(_)) => return None,
                // Control frames are handled by the websocket layer.
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Err(e) => return Some(Err(TransportError::new(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.send(Message::Close(None)).await;
    }
}

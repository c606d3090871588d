#![forbid(unsafe_code)]

// Signaling module - control connections and the HTTP surface room servers talk to

pub mod connection;
pub mod pipeline;
pub mod protocol;
pub mod websocket;

pub use connection::{ControlConnection, LoadSource, Notifier, SERVER_ERROR};
pub use pipeline::{DispatchContext, HandlerKey, MethodHandler, Pipeline};
pub use protocol::{ConnectionError, Envelope, InboundMessage, PeerConnection, SocketMessage};
pub use websocket::WebSocketPeer;

use crate::node::MediaNode;
use axum::{
    extract::ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
    extract::State,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    node: Arc<MediaNode>,
    secret: Option<Arc<str>>,
}

impl SignalingServer {
    pub fn new(node: Arc<MediaNode>, secret: Option<String>) -> Self {
        if secret.is_some() {
            info!("Bearer authentication enabled");
        } else {
            info!("No secret configured, authentication disabled");
        }

        Self {
            node,
            secret: secret.map(Arc::from),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/load", get(load_handler))
            .fallback(fallback_handler)
            .with_state(self)
    }

    /// Starts the signaling server
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the address
    pub async fn serve(self, host: IpAddr, port: u16) -> anyhow::Result<()> {
        let addr = SocketAddr::new(host, port);
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(secret) = &self.secret else { return true };
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        provided.strip_prefix("Bearer ") == Some(secret.as_ref())
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Per-worker consumer and router counts, keyed by pid
async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    Json(server.node.workers().metrics()).into_response()
}

async fn load_handler(State(server): State<SignalingServer>) -> Response {
    Json(server.node.load().snapshot()).into_response()
}

async fn fallback_handler(method: Method) -> Response {
    if method != Method::GET {
        return (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, "GET")]).into_response();
    }
    (StatusCode::NOT_FOUND, "Not found").into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !server.authorized(&headers) {
        warn!("Rejecting WebSocket upgrade without a valid bearer token");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.max_message_size(1 << 20)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            let (peer, inbound) = WebSocketPeer::attach(sink, stream);
            let room_server = server.node.accept(peer, inbound);
            debug!("WebSocket attached to room server {}", room_server.id());
        })
}

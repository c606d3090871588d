#![forbid(unsafe_code)]

// Control connection - one orchestrator link, dispatched through the method pipeline

use super::pipeline::{DispatchContext, Pipeline};
use super::protocol::{ConnectionError, InboundMessage, PeerConnection, SocketMessage};
use crate::engine::{OnceListeners, Subscription};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// The only rejection reason a peer ever sees
pub const SERVER_ERROR: &str = "Server error";

/// Supplies the admission-control figure stamped on outbound traffic
pub trait LoadSource: Send + Sync {
    fn load(&self) -> f64;
}

/// Wraps one peer connection: runs inbound messages through the pipeline and stamps
/// the current load on everything it sends.
pub struct ControlConnection {
    id: Uuid,
    peer: Arc<dyn PeerConnection>,
    load: Arc<dyn LoadSource>,
    pipeline: Pipeline,
    closed: AtomicBool,
    close_listeners: OnceListeners<()>,
}

impl ControlConnection {
    pub fn new(peer: Arc<dyn PeerConnection>, load: Arc<dyn LoadSource>) -> Arc<Self> {
        let id = Uuid::new_v4();
        debug!("ControlConnection {} created", id);

        Arc::new(Self {
            id,
            peer,
            load,
            pipeline: Pipeline::new(),
            closed: AtomicBool::new(false),
            close_listeners: OnceListeners::new(),
        })
    }

    /// Creates the connection and starts consuming `inbound`. Each request is dispatched
    /// on its own task so a slow one never blocks the others.
    pub fn spawn(
        peer: Arc<dyn PeerConnection>,
        load: Arc<dyn LoadSource>,
        mut inbound: mpsc::Receiver<InboundMessage>,
    ) -> Arc<Self> {
        let connection = Self::new(peer, load);

        let this = connection.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                match message {
                    InboundMessage::Request { message, responder } => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            let result = this.handle_request(message).await;
                            if responder.send(result).is_err() {
                                debug!("Connection {} went away before the response", this.id);
                            }
                        });
                    }
                    InboundMessage::Notification(message) => {
                        let this = this.clone();
                        tokio::spawn(async move { this.handle_notification(message).await });
                    }
                    InboundMessage::Closed => break,
                }
            }
            this.close();
        });

        connection
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Handle for close hooks that must not keep the connection alive
    pub fn notifier(self: &Arc<Self>) -> Notifier {
        Notifier {
            connection: Arc::downgrade(self),
        }
    }

    /// Dispatches a request. Failures are logged and reduced to `SERVER_ERROR`.
    pub async fn handle_request(&self, message: SocketMessage) -> Result<Map<String, Value>, String> {
        let method = message.method.clone();
        let mut context = DispatchContext::new(message);

        match self.pipeline.execute(&mut context).await {
            Ok(()) if context.handled => {
                context.respond("load", self.load.load());
                Ok(context.response)
            }
            Ok(()) => {
                debug!("Unhandled request [method: {}]", method);
                Err(SERVER_ERROR.to_string())
            }
            Err(e) => {
                error!("Request {} failed: {}", method, e);
                Err(SERVER_ERROR.to_string())
            }
        }
    }

    /// Dispatches a notification. Nothing is ever reported back to the peer.
    pub async fn handle_notification(&self, message: SocketMessage) {
        let method = message.method.clone();
        let mut context = DispatchContext::new(message);

        match self.pipeline.execute(&mut context).await {
            Ok(()) if context.handled => {}
            Ok(()) => error!("No handler for notification [method: {}]", method),
            Err(e) => error!("Notification {} failed: {}", method, e),
        }
    }

    pub fn notify(&self, mut message: SocketMessage) {
        if self.closed() {
            return;
        }
        debug!("notify() [method: {}]", message.method);

        message.stamp_load(self.load.load());
        if let Err(e) = self.peer.notify(message) {
            error!("Failed to notify peer on {}: {}", self.id, e);
        }
    }

    pub async fn request(&self, mut message: SocketMessage) -> Result<Value, ConnectionError> {
        if self.closed() {
            return Err(ConnectionError::Closed);
        }
        debug!("request() [method: {}]", message.method);

        message.stamp_load(self.load.load());
        self.peer.request(message).await.inspect_err(|e| {
            error!("Request to peer on {} failed: {}", self.id, e);
        })
    }

    /// Tells the peer to stop placing work here within `timeout`
    pub fn drain(&self, timeout: Duration) {
        info!("Draining connection {} [timeout: {}s]", self.id, timeout.as_secs());
        self.notify(SocketMessage::new("mediaNodeDrain", json!({ "timeout": timeout.as_secs() })));
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("ControlConnection {} closed", self.id);

        self.peer.close();
        self.close_listeners.fire(());
    }

    pub fn on_close(&self, callback: Box<dyn FnOnce() + Send>) -> Subscription {
        self.close_listeners.add(Box::new(move |()| callback()))
    }
}

/// Weak handle that forwards notifications while the connection is alive
#[derive(Clone)]
pub struct Notifier {
    connection: Weak<ControlConnection>,
}

impl Notifier {
    pub fn notify(&self, message: SocketMessage) {
        if let Some(connection) = self.connection.upgrade() {
            connection.notify(message);
        }
    }
}

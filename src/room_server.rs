#![forbid(unsafe_code)]

// Per-connection composition root: installs the handlers and owns the connection's routers

use crate::engine::{OnceListeners, Resource, Subscription};
use crate::handlers::{
    ConsumerHandler, DataHandler, ObserverHandler, ProducerHandler, RouterHandler, Session, TransportHandler,
};
use crate::media::WorkerManager;
use crate::signaling::{ControlConnection, HandlerKey, MethodHandler, SocketMessage};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// Serves one control connection. Closes with it, and closing it closes the connection.
pub struct RoomServer {
    connection: Arc<ControlConnection>,
    session: Arc<Session>,
    handler_keys: Mutex<Vec<HandlerKey>>,
    connection_closed: Mutex<Option<Subscription>>,
    closed: AtomicBool,
    close_listeners: OnceListeners<()>,
}

impl RoomServer {
    pub fn new(connection: Arc<ControlConnection>, workers: Arc<WorkerManager>) -> Arc<Self> {
        debug!("RoomServer created for connection {}", connection.id());

        let session = Session::new(workers.clone(), connection.notifier());
        let handlers: [Arc<dyn MethodHandler>; 6] = [
            Arc::new(RouterHandler::new(session.clone())),
            Arc::new(ObserverHandler::new(session.clone())),
            Arc::new(TransportHandler::new(session.clone())),
            Arc::new(ProducerHandler::new(session.clone())),
            Arc::new(ConsumerHandler::new(session.clone())),
            Arc::new(DataHandler::new(session.clone())),
        ];
        let handler_keys: Vec<HandlerKey> = handlers
            .into_iter()
            .map(|handler| connection.pipeline().use_handler(handler))
            .collect();

        let server = Arc::new(Self {
            connection: connection.clone(),
            session,
            handler_keys: Mutex::new(handler_keys),
            connection_closed: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_listeners: OnceListeners::new(),
        });

        // The callback runs inline if the connection is already gone
        let weak = Arc::downgrade(&server);
        let subscription = connection.on_close(Box::new(move || {
            if let Some(server) = weak.upgrade() {
                server.close();
            }
        }));
        if !server.closed() {
            *server.connection_closed.lock().unwrap_or_else(|e| e.into_inner()) = Some(subscription);
        }

        connection.notify(SocketMessage::new(
            "mediaNodeReady",
            json!({ "workers": workers.worker_count() }),
        ));

        server
    }

    pub fn id(&self) -> Uuid {
        self.connection.id()
    }

    pub fn connection(&self) -> &Arc<ControlConnection> {
        &self.connection
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Unregisters the handlers, closes the connection and every router it obtained.
    /// Safe to call more than once, from either side.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing RoomServer {}", self.connection.id());

        let keys = std::mem::take(&mut *self.handler_keys.lock().unwrap_or_else(|e| e.into_inner()));
        for key in keys {
            self.connection.pipeline().remove(key);
        }

        drop(self.connection_closed.lock().unwrap_or_else(|e| e.into_inner()).take());
        self.connection.close();

        for router in self.session.routers.values() {
            router.close();
        }

        self.close_listeners.fire(());
    }

    pub fn on_close(&self, callback: Box<dyn FnOnce() + Send>) -> Subscription {
        self.close_listeners.add(Box::new(move |()| callback()))
    }
}

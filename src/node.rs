#![forbid(unsafe_code)]

// Process-wide service: worker pool, load figure and the live room server connections

use crate::load::LoadManager;
use crate::media::WorkerManager;
use crate::room_server::RoomServer;
use crate::signaling::{ControlConnection, InboundMessage, PeerConnection};
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct MediaNode {
    workers: Arc<WorkerManager>,
    load: Arc<LoadManager>,
    room_servers: StdRwLock<HashMap<Uuid, Arc<RoomServer>>>,
    drain_timer: Mutex<Option<JoinHandle<()>>>,
    me: Weak<MediaNode>,
}

impl MediaNode {
    pub fn new(workers: Arc<WorkerManager>, load: Arc<LoadManager>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            workers,
            load,
            room_servers: StdRwLock::new(HashMap::new()),
            drain_timer: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn workers(&self) -> &Arc<WorkerManager> {
        &self.workers
    }

    pub fn load(&self) -> &Arc<LoadManager> {
        &self.load
    }

    /// Serves a freshly attached peer until either side closes
    pub fn accept(&self, peer: Arc<dyn PeerConnection>, inbound: mpsc::Receiver<InboundMessage>) -> Arc<RoomServer> {
        let connection = ControlConnection::spawn(peer, self.load.clone(), inbound);
        let server = RoomServer::new(connection, self.workers.clone());
        let id = server.id();
        info!("Room server connected [id: {}]", id);

        self.room_servers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, server.clone());

        let node = self.me.clone();
        server
            .on_close(Box::new(move || {
                if let Some(node) = node.upgrade() {
                    node.room_servers.write().unwrap_or_else(|e| e.into_inner()).remove(&id);
                    debug!("Room server disconnected [id: {}]", id);
                }
            }))
            .detach();

        server
    }

    pub fn room_servers(&self) -> Vec<Arc<RoomServer>> {
        self.room_servers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.room_servers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Asks every connected room server to move its rooms elsewhere, and closes whatever
    /// is still connected once `timeout` runs out. A second drain restarts the timer.
    pub fn drain(&self, timeout: Duration) {
        info!("Draining media node [timeout: {}s]", timeout.as_secs());

        for server in self.room_servers() {
            server.connection().drain(timeout);
        }

        let node = self.me.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(node) = node.upgrade() else { return };
            info!("Drain timeout reached, closing {} room servers", node.connection_count());
            node.close_room_servers();
        });

        if let Some(previous) = self.drain_timer.lock().unwrap_or_else(|e| e.into_inner()).replace(timer) {
            previous.abort();
        }
    }

    /// Returns false if no drain was in progress
    pub fn cancel_drain(&self) -> bool {
        match self.drain_timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(timer) => {
                timer.abort();
                info!("Drain cancelled");
                true
            }
            None => {
                warn!("No drain in progress");
                false
            }
        }
    }

    fn close_room_servers(&self) {
        for server in self.room_servers() {
            server.close();
        }
    }

    pub fn shutdown(&self) {
        info!("Shutting down media node");
        self.cancel_drain_silently();
        self.close_room_servers();
        self.load.stop();
        self.workers.shutdown();
    }

    fn cancel_drain_silently(&self) {
        if let Some(timer) = self.drain_timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            timer.abort();
        }
    }
}

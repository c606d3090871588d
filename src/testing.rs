#![forbid(unsafe_code)]

// Test doubles shared by the unit tests

use crate::signaling::connection::{ControlConnection, LoadSource};
use crate::signaling::protocol::{ConnectionError, PeerConnection, SocketMessage};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub struct FixedLoad(pub f64);

impl LoadSource for FixedLoad {
    fn load(&self) -> f64 {
        self.0
    }
}

/// Peer that records everything sent to it
#[derive(Default)]
pub struct RecordingPeer {
    notifications: Mutex<Vec<SocketMessage>>,
    requests: Mutex<Vec<SocketMessage>>,
    closed: AtomicBool,
}

impl RecordingPeer {
    pub fn notifications(&self) -> Vec<SocketMessage> {
        self.notifications.lock().unwrap().clone()
    }

    /// Payloads of every notification named `method`
    pub fn notifications_named(&self, method: &str) -> Vec<Value> {
        self.notifications()
            .into_iter()
            .filter(|n| n.method == method)
            .map(|n| n.data)
            .collect()
    }

    pub fn requests(&self) -> Vec<SocketMessage> {
        self.requests.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for RecordingPeer {
    fn notify(&self, message: SocketMessage) -> Result<(), ConnectionError> {
        self.notifications.lock().unwrap().push(message);
        Ok(())
    }

    async fn request(&self, message: SocketMessage) -> Result<Value, ConnectionError> {
        self.requests.lock().unwrap().push(message);
        Ok(Value::Null)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A connection with load 42 wired to a fresh recording peer
pub fn recording_connection() -> (Arc<ControlConnection>, Arc<RecordingPeer>) {
    let peer = Arc::new(RecordingPeer::default());
    let connection = ControlConnection::new(peer.clone(), Arc::new(FixedLoad(42.0)));
    (connection, peer)
}

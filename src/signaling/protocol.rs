#![forbid(unsafe_code)]

// Signaling protocol - message shapes exchanged with the orchestrator

use crate::media::types::{MediaError, MediaResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::oneshot;

/// `{method, data}` carried by requests and notifications in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketMessage {
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

impl SocketMessage {
    pub fn new(method: impl Into<String>, data: Value) -> Self {
        Self {
            method: method.into(),
            data,
        }
    }

    /// Deserializes `data` into a typed request body
    pub fn parse<T: DeserializeOwned>(&self) -> MediaResult<T> {
        let data = if self.data.is_null() { Value::Object(Map::new()) } else { self.data.clone() };
        serde_json::from_value(data)
            .map_err(|e| MediaError::InvalidRequest(format!("{}: {e}", self.method)))
    }

    /// Adds the admission-control figure, turning a missing payload into an object
    pub fn stamp_load(&mut self, load: f64) {
        if !self.data.is_object() {
            self.data = Value::Object(Map::new());
        }
        if let Value::Object(data) = &mut self.data {
            data.insert("load".to_string(), load.into());
        }
    }
}

/// Frames on the wire, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        data: Value,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_reason: Option<String>,
    },
    Notification {
        method: String,
        #[serde(default)]
        data: Value,
    },
}

/// Errors raised by a peer connection
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("Request timed out")]
    Timeout,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Responder = oneshot::Sender<Result<Map<String, Value>, String>>;

/// What a peer connection hands to its owner
pub enum InboundMessage {
    /// Must be answered exactly once through `responder`
    Request { message: SocketMessage, responder: Responder },
    Notification(SocketMessage),
    Closed,
}

/// Outbound side of one bidirectional request/notify link
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn notify(&self, message: SocketMessage) -> Result<(), ConnectionError>;
    async fn request(&self, message: SocketMessage) -> Result<Value, ConnectionError>;
    fn close(&self);
}

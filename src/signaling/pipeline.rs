#![forbid(unsafe_code)]

// Ordered method-handler list run for every inbound message

use super::protocol::SocketMessage;
use crate::media::types::MediaResult;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

/// State threaded through every handler for one message
#[derive(Debug)]
pub struct DispatchContext {
    pub message: SocketMessage,
    pub response: Map<String, Value>,
    pub handled: bool,
}

impl DispatchContext {
    pub fn new(message: SocketMessage) -> Self {
        Self {
            message,
            response: Map::new(),
            handled: false,
        }
    }

    pub fn method(&self) -> &str {
        &self.message.method
    }

    pub fn respond(&mut self, key: &str, value: impl Into<Value>) {
        self.response.insert(key.to_string(), value.into());
    }
}

/// One entry of the pipeline. Handlers see every message and act only on the methods
/// they own; an error aborts the rest of the pipeline for that message.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, context: &mut DispatchContext) -> MediaResult<()>;
}

/// Returned by `Pipeline::use_handler`, used to remove the handler again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey(u64);

#[derive(Default)]
pub struct Pipeline {
    next_key: AtomicU64,
    handlers: StdRwLock<Vec<(HandlerKey, Arc<dyn MethodHandler>)>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_handler(&self, handler: Arc<dyn MethodHandler>) -> HandlerKey {
        let key = HandlerKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((key, handler));
        key
    }

    pub fn remove(&self, key: HandlerKey) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(k, _)| *k != key);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every handler in registration order. Handlers added or removed while a
    /// message is in flight take effect from the next message.
    pub async fn execute(&self, context: &mut DispatchContext) -> MediaResult<()> {
        let handlers: Vec<Arc<dyn MethodHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            handler.handle(context).await?;
        }
        Ok(())
    }
}

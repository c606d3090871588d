#![forbid(unsafe_code)]

// Common types and error handling for the media module

use crate::engine::EngineError;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Custom error type for media operations
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{operation} failed: {source}")]
    OperationFailed {
        operation: &'static str,
        #[source]
        source: EngineError,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl MediaError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Wraps a collaborator failure so the engine's detail stays in the logs.
    pub fn failed(operation: &'static str) -> impl FnOnce(EngineError) -> Self {
        move |source| Self::OperationFailed { operation, source }
    }
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Coarse per-worker counters served on `/metrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerMetrics {
    pub consumers: usize,
    pub routers: usize,
}

/// Keyed by worker pid
pub type PoolMetrics = BTreeMap<u32, WorkerMetrics>;

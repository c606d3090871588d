#![forbid(unsafe_code)]

// Media module - worker pool, router placement and the per-router resource maps

pub mod config;
pub mod placement;
pub mod registry;
pub mod router;
pub mod types;
pub mod worker_manager;

pub use config::{MediaConfig, RouterConfig, SchedulerConfig, WebRtcTransportConfig, WorkerConfig};
pub use placement::{place, Placement, PlacementReason, WorkerLoad};
pub use registry::{ClosedNotice, Registry};
pub use router::Router;
pub use types::{MediaError, MediaResult, PoolMetrics, WorkerMetrics};
pub use worker_manager::{Worker, WorkerManager};

#![forbid(unsafe_code)]

// Method handlers - one per resource family, all sharing the connection's session

pub mod consumer;
pub mod data;
pub mod observer;
pub mod producer;
pub mod router;
pub mod transport;

pub use consumer::ConsumerHandler;
pub use data::DataHandler;
pub use observer::ObserverHandler;
pub use producer::ProducerHandler;
pub use router::RouterHandler;
pub use transport::TransportHandler;

use crate::engine::{Resource, Subscription};
use crate::media::{ClosedNotice, MediaError, MediaResult, Registry, Router, WorkerManager};
use crate::signaling::Notifier;
use serde_json::Value;
use std::sync::Arc;

/// State shared by every handler of one connection
pub struct Session {
    /// Routers this connection obtained through `getRouter`
    pub routers: Registry<Router>,
    pub workers: Arc<WorkerManager>,
    pub notifier: Notifier,
}

impl Session {
    pub fn new(workers: Arc<WorkerManager>, notifier: Notifier) -> Arc<Self> {
        Arc::new(Self {
            routers: Registry::new("router"),
            workers,
            notifier,
        })
    }

    pub fn router(&self, router_id: &str) -> MediaResult<Arc<Router>> {
        self.routers.get(router_id)
    }

    pub fn notice(&self, method: &'static str, data: Value) -> ClosedNotice {
        ClosedNotice {
            notifier: self.notifier.clone(),
            method,
            data,
        }
    }
}

/// Puts a freshly created engine resource under registry ownership. A clashing id means
/// the new resource can never be addressed, so it is closed again.
pub(crate) fn adopt<T: Resource + ?Sized + 'static>(
    registry: &Registry<T>,
    resource: Arc<T>,
    notice: ClosedNotice,
    subscriptions: Vec<Subscription>,
) -> MediaResult<()> {
    if registry.register(resource.clone(), notice, subscriptions) {
        return Ok(());
    }

    let id = resource.id().to_string();
    resource.close();
    Err(MediaError::InvalidRequest(format!("duplicate {} id {}", registry.kind(), id)))
}

#![forbid(unsafe_code)]

// Worker pool management: crash recovery, CPU sampling and router placement

use crate::engine::{Consumer, EngineWorker, MediaEngine, Resource, ResourceUsage, Subscription};
use crate::media::config::MediaConfig;
use crate::media::placement::{place, WorkerLoad};
use crate::media::router::Router;
use crate::media::types::{MediaError, MediaResult, PoolMetrics, WorkerMetrics};
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

type RouterFuture = Shared<BoxFuture<'static, MediaResult<Arc<Router>>>>;

/// A room's router on one worker, or its creation in flight
enum RouterSlot {
    Pending(RouterFuture),
    Ready(Arc<Router>),
}

#[derive(Default)]
struct LoadState {
    cpu_usage: f64,
    last_usage: Option<ResourceUsage>,
}

/// One engine worker plus the scheduler's bookkeeping for it
pub struct Worker {
    engine: Arc<dyn EngineWorker>,
    pid: u32,
    load: StdRwLock<LoadState>,
    routers: StdRwLock<HashMap<String, RouterSlot>>,
    consumers: Arc<StdRwLock<HashMap<String, Subscription>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Worker {
    fn new(engine: Arc<dyn EngineWorker>) -> Arc<Self> {
        let worker = Arc::new(Self {
            pid: engine.pid(),
            engine,
            load: StdRwLock::new(LoadState::default()),
            routers: StdRwLock::new(HashMap::new()),
            consumers: Arc::new(StdRwLock::new(HashMap::new())),
            subscriptions: Mutex::new(Vec::new()),
        });
        worker.track_consumers();
        worker
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn cpu_usage(&self) -> f64 {
        self.load.read().unwrap_or_else(|e| e.into_inner()).cpu_usage
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Routers created or being created on this worker
    pub fn router_count(&self) -> usize {
        self.routers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn hold(&self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(subscription);
    }

    /// Keeps the set of live consumer ids on this worker current
    fn track_consumers(&self) {
        let consumers = Arc::downgrade(&self.consumers);
        let subscription = self.engine.on_new_consumer(Arc::new(move |consumer: &Arc<dyn Consumer>| {
            let Some(map) = consumers.upgrade() else { return };
            if consumer.closed() {
                return;
            }

            let id = consumer.id().to_string();
            let weak_map = Arc::downgrade(&map);
            let hook_id = id.clone();
            let hook = consumer.on_close(Box::new(move || {
                if let Some(map) = weak_map.upgrade() {
                    let removed = map.write().unwrap_or_else(|e| e.into_inner()).remove(&hook_id);
                    drop(removed);
                }
            }));

            map.write().unwrap_or_else(|e| e.into_inner()).insert(id.clone(), hook);
            if consumer.closed() {
                let removed = map.write().unwrap_or_else(|e| e.into_inner()).remove(&id);
                drop(removed);
            }
        }));
        self.hold(subscription);
    }

    fn record_usage(&self, usage: ResourceUsage, interval: Duration) {
        let mut load = self.load.write().unwrap_or_else(|e| e.into_inner());
        let previous = load.last_usage.unwrap_or_default();
        let spent = usage.cpu_time().saturating_sub(previous.cpu_time());

        load.cpu_usage = spent.as_secs_f64() / interval.as_secs_f64() * 100.0;
        load.last_usage = Some(usage);
    }

    fn slot(&self, room_id: &str) -> Option<Result<Arc<Router>, RouterFuture>> {
        let routers = self.routers.read().unwrap_or_else(|e| e.into_inner());
        routers.get(room_id).map(|slot| match slot {
            RouterSlot::Ready(router) => Ok(router.clone()),
            RouterSlot::Pending(future) => Err(future.clone()),
        })
    }

    /// Replaces the pending slot once creation settled
    fn settle(&self, room_id: &str, router: Option<&Arc<Router>>) {
        let mut routers = self.routers.write().unwrap_or_else(|e| e.into_inner());
        let pending = matches!(routers.get(room_id), Some(RouterSlot::Pending(_)));
        if !pending {
            return;
        }

        let previous = match router {
            Some(router) => routers.insert(room_id.to_string(), RouterSlot::Ready(router.clone())),
            None => routers.remove(room_id),
        };
        drop(routers);
        drop(previous);
    }

    fn forget_router(&self, room_id: &str, router_id: &str) {
        let mut routers = self.routers.write().unwrap_or_else(|e| e.into_inner());
        let matches = match routers.get(room_id) {
            Some(RouterSlot::Ready(router)) => router.id() == router_id,
            Some(RouterSlot::Pending(_)) => true,
            None => false,
        };
        let removed = if matches { routers.remove(room_id) } else { None };
        drop(routers);
        drop(removed);
    }

    fn close(&self) {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.engine.close();
    }
}

/// Manages a pool of media-engine workers
pub struct WorkerManager {
    engine: Arc<dyn MediaEngine>,
    config: Arc<MediaConfig>,
    workers: StdRwLock<Vec<Arc<Worker>>>,
    closed: AtomicBool,
    sampler: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
    me: Weak<WorkerManager>,
}

impl WorkerManager {
    /// Starts `num_workers` workers and the load sampler
    ///
    /// # Errors
    /// Fails if any worker cannot start or open its listening server; workers already
    /// started are closed again.
    pub async fn start(engine: Arc<dyn MediaEngine>, config: Arc<MediaConfig>) -> MediaResult<Arc<Self>> {
        let num_workers = config.worker_config.num_workers;
        info!("Creating WorkerManager with {} workers", num_workers);

        let manager = Arc::new_cyclic(|me| Self {
            engine,
            config,
            workers: StdRwLock::new(Vec::with_capacity(num_workers)),
            closed: AtomicBool::new(false),
            sampler: Mutex::new(None),
            runtime: Handle::current(),
            me: me.clone(),
        });

        for i in 0..num_workers {
            if let Err(e) = manager.start_worker().await {
                error!("Failed to start worker {}: {}", i, e);
                manager.shutdown();
                return Err(e);
            }
        }

        manager.start_sampler();
        Ok(manager)
    }

    async fn start_worker(&self) -> MediaResult<Arc<Worker>> {
        if self.closed() {
            return Err(MediaError::Closed("worker manager"));
        }

        let settings = self.config.worker_config.to_worker_settings();
        let engine_worker = self
            .engine
            .create_worker(&settings)
            .await
            .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;
        let pid = engine_worker.pid();

        let listen_infos = self.config.worker_config.webrtc_server_listen_infos();
        if let Err(e) = engine_worker.create_webrtc_server(&listen_infos).await {
            engine_worker.close();
            return Err(MediaError::WorkerError(format!(
                "Failed to create WebRtcServer for worker {pid}: {e}"
            )));
        }

        let worker = Worker::new(engine_worker.clone());
        let manager = self.me.clone();
        let dead = Arc::downgrade(&worker);
        worker.hold(engine_worker.on_died(Box::new(move |reason| {
            if let (Some(manager), Some(worker)) = (manager.upgrade(), dead.upgrade()) {
                manager.worker_died(&worker, &reason);
            }
        })));

        // The pool may have been shut down while the worker was starting
        if self.closed() {
            worker.close();
            return Err(MediaError::Closed("worker manager"));
        }

        self.workers.write().unwrap_or_else(|e| e.into_inner()).push(worker.clone());
        info!("Worker {} started", pid);
        Ok(worker)
    }

    /// Drops the dead worker right away and starts a replacement in the background
    fn worker_died(&self, worker: &Arc<Worker>, reason: &str) {
        if self.closed() {
            return;
        }
        error!("Worker {} died ({}), restarting", worker.pid, reason);

        self.workers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|w| !Arc::ptr_eq(w, worker));

        let manager = self.me.clone();
        self.runtime.spawn(async move {
            let Some(manager) = manager.upgrade() else { return };
            match manager.start_worker().await {
                Ok(worker) => info!("Replacement worker {} started", worker.pid),
                Err(e) => error!("Failed to restart worker: {}", e),
            }
        });
    }

    fn start_sampler(&self) {
        let period = self.config.scheduler_config.load_polling_interval;
        let manager = self.me.clone();

        let handle = self.runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                manager.sample_load().await;
            }
        });

        *self.sampler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Samples every worker's CPU time once. A worker whose sample fails keeps its
    /// previous figure; the others are unaffected.
    pub async fn sample_load(&self) {
        let interval = self.config.scheduler_config.load_polling_interval;
        let workers = self.workers();
        let usages = join_all(workers.iter().map(|w| w.engine.resource_usage())).await;

        for (worker, usage) in workers.iter().zip(usages) {
            match usage {
                Ok(usage) => worker.record_usage(usage, interval),
                Err(e) => error!("Error getting resource usage of worker {}: {}", worker.pid, e),
            }
        }
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn cpu_loads(&self) -> Vec<f64> {
        self.workers().iter().map(|w| w.cpu_usage()).collect()
    }

    pub fn config(&self) -> &Arc<MediaConfig> {
        &self.config
    }

    /// Returns the router that should serve the next participant of `room_id`,
    /// creating one if placement says so.
    pub async fn get_router(&self, room_id: &str) -> MediaResult<Arc<Router>> {
        if self.closed() {
            return Err(MediaError::Closed("worker manager"));
        }
        debug!("getRouter() [roomId: {}]", room_id);

        let mut hosting = HashSet::new();
        for worker in self.workers() {
            let router = match worker.slot(room_id) {
                Some(Ok(router)) => router,
                Some(Err(pending)) => pending.await?,
                None => continue,
            };
            if !router.closed() {
                hosting.insert(worker.pid);
            }
        }

        // Re-read the pool: workers may have died while creations were awaited
        let workers = self.workers();
        let loads: Vec<WorkerLoad> = workers
            .iter()
            .map(|w| WorkerLoad {
                pid: w.pid,
                cpu_usage: w.cpu_usage(),
                hosts_room: hosting.contains(&w.pid),
            })
            .collect();

        let placement = place(&loads, &self.config.scheduler_config)
            .ok_or_else(|| MediaError::WorkerError("No workers available".to_string()))?;
        debug!(
            "getRouter() {} [roomId: {}, workerPid: {}]",
            placement.reason, room_id, placement.pid
        );

        let worker = workers
            .into_iter()
            .find(|w| w.pid == placement.pid)
            .ok_or_else(|| MediaError::WorkerError(format!("Worker {} vanished", placement.pid)))?;
        self.get_or_create_router(&worker, room_id).await
    }

    /// Returns the worker's router for the room. Concurrent callers share one creation.
    pub async fn get_or_create_router(&self, worker: &Arc<Worker>, room_id: &str) -> MediaResult<Arc<Router>> {
        let future = {
            let mut routers = worker.routers.write().unwrap_or_else(|e| e.into_inner());
            match routers.get(room_id) {
                Some(RouterSlot::Ready(router)) => return Ok(router.clone()),
                Some(RouterSlot::Pending(future)) => future.clone(),
                None => {
                    let future = self.create_router(worker.clone(), room_id.to_string()).boxed().shared();
                    routers.insert(room_id.to_string(), RouterSlot::Pending(future.clone()));
                    future
                }
            }
        };

        future.await
    }

    fn create_router(
        &self,
        worker: Arc<Worker>,
        room_id: String,
    ) -> impl std::future::Future<Output = MediaResult<Arc<Router>>> + Send + 'static {
        let options = self.config.router_config.to_router_options();
        let manager = self.me.clone();

        async move {
            let result = Self::build_router(&worker, &room_id, options, manager).await;
            worker.settle(&room_id, result.as_ref().ok());
            result
        }
    }

    async fn build_router(
        worker: &Arc<Worker>,
        room_id: &str,
        options: crate::engine::RouterOptions,
        manager: Weak<WorkerManager>,
    ) -> MediaResult<Arc<Router>> {
        let engine_router = worker
            .engine
            .create_router(options)
            .await
            .map_err(MediaError::failed("createRouter"))?;

        let router = Arc::new(Router::new(engine_router, room_id.to_string(), worker.pid));

        let gone = manager.upgrade().map_or(true, |m| m.closed());
        if gone || worker.engine.closed() {
            router.close();
            return Err(MediaError::Closed("worker"));
        }

        let cache = Arc::downgrade(worker);
        let hook_room = room_id.to_string();
        let hook_router = router.id().to_string();
        router
            .on_close(Box::new(move || {
                debug!("Router {} of room {} closed", hook_router, hook_room);
                if let Some(worker) = cache.upgrade() {
                    worker.forget_router(&hook_room, &hook_router);
                }
            }))
            .detach();

        if router.closed() {
            return Err(MediaError::Closed("router"));
        }

        debug!(
            "New router [roomId: {}, routerId: {}, workerPid: {}]",
            room_id,
            router.id(),
            worker.pid
        );
        Ok(router)
    }

    /// Per-worker consumer and router counts
    pub fn metrics(&self) -> PoolMetrics {
        self.workers()
            .iter()
            .map(|w| {
                (
                    w.pid,
                    WorkerMetrics {
                        consumers: w.consumer_count(),
                        routers: w.router_count(),
                    },
                )
            })
            .collect()
    }

    /// Stops sampling and closes every worker. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down all workers");

        if let Some(sampler) = self.sampler.lock().unwrap_or_else(|e| e.into_inner()).take() {
            sampler.abort();
        }

        let workers = std::mem::take(&mut *self.workers.write().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            worker.close();
        }

        info!("All workers shut down");
    }
}

impl Drop for WorkerManager {
    fn drop(&mut self) {
        if !self.closed() {
            warn!("WorkerManager dropped without shutdown");
        }
    }
}

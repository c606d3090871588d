#![forbid(unsafe_code)]

// In-process engine: allocates identifiers and drives lifecycle events, carries no media
//
// Close semantics follow a real SFU: closing a router closes its transports and observers,
// closing a transport closes everything produced or consumed on it, and closing a producer
// closes the consumers fed by it.

use super::{
    ActiveSpeakerObserverOptions, AudioLevel, AudioLevelObserverOptions, Consumer, ConsumerEvent,
    ConsumerLayers, ConsumerOptions, DataConsumer, DataConsumerOptions, DataProducer,
    DataProducerOptions, EngineError, EngineResult, EngineRouter, EngineWorker, ListenInfo,
    Listeners, MediaEngine, MediaKind, OnceListeners, PipeTransportOptions, PlainTransportOptions,
    Producer, ProducerEvent, ProducerOptions, Resource, ResourceUsage, RouterOptions,
    RtpCodecCapability, RtpObserver, RtpObserverEvent, Subscription, Transport, TransportKind,
    WebRtcTransportOptions, WorkerSettings,
};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

type NewConsumerListeners = Arc<Listeners<Arc<dyn Consumer>>>;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

struct ResourceCore {
    id: String,
    closed: AtomicBool,
    close_listeners: OnceListeners<()>,
}

impl ResourceCore {
    fn new(id: String) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            close_listeners: OnceListeners::new(),
        }
    }

    /// True for the caller that transitions the resource to closed.
    fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn finish_close(&self) {
        self.close_listeners.fire(());
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self, what: &'static str) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed(what));
        }
        Ok(())
    }

    fn on_close(&self, callback: Box<dyn FnOnce() + Send>) -> Subscription {
        self.close_listeners.add(Box::new(move |()| callback()))
    }
}

macro_rules! impl_resource {
    ($ty:ty) => {
        impl Resource for $ty {
            fn id(&self) -> &str {
                &self.core.id
            }

            fn closed(&self) -> bool {
                self.core.is_closed()
            }

            fn close(&self) {
                self.shutdown();
            }

            fn on_close(&self, callback: Box<dyn FnOnce() + Send>) -> Subscription {
                self.core.on_close(callback)
            }
        }
    };
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Pushes a child, pruning the ones that already closed.
fn track<T: Resource + ?Sized>(list: &Mutex<Vec<Arc<T>>>, item: Arc<T>) {
    let mut list = lock(list);
    list.retain(|existing| !existing.closed());
    list.push(item);
}

fn drain<T>(list: &Mutex<Vec<Arc<T>>>) -> Vec<Arc<T>> {
    std::mem::take(&mut *lock(list))
}

/// Engine whose workers live inside this process
pub struct MemoryEngine {
    next_pid: AtomicU32,
    workers: Mutex<Vec<Arc<MemoryWorker>>>,
    fail_worker_creation: AtomicBool,
    fail_webrtc_server: AtomicBool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            workers: Mutex::new(Vec::new()),
            fail_worker_creation: AtomicBool::new(false),
            fail_webrtc_server: AtomicBool::new(false),
        }
    }

    /// Every worker this engine ever created, dead ones included
    pub fn workers(&self) -> Vec<Arc<MemoryWorker>> {
        lock(&self.workers).clone()
    }

    pub fn worker(&self, pid: u32) -> Option<Arc<MemoryWorker>> {
        lock(&self.workers).iter().find(|w| w.pid == pid).cloned()
    }

    pub fn set_fail_worker_creation(&self, fail: bool) {
        self.fail_worker_creation.store(fail, Ordering::SeqCst);
    }

    /// Workers created afterwards fail to open their listening server
    pub fn set_fail_webrtc_server(&self, fail: bool) {
        self.fail_webrtc_server.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MemoryEngine {
    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn EngineWorker>> {
        tokio::task::yield_now().await;

        if self.fail_worker_creation.load(Ordering::SeqCst) {
            return Err(EngineError::Request("failed to spawn worker process".to_string()));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let worker = Arc::new(MemoryWorker {
            pid,
            rtc_ports: Arc::new(AtomicU16::new(*settings.rtc_port_range.start())),
            closed: AtomicBool::new(false),
            listen_infos: Mutex::new(None),
            fail_webrtc_server: self.fail_webrtc_server.load(Ordering::SeqCst),
            fail_resource_usage: AtomicBool::new(false),
            fail_router_creation: AtomicBool::new(false),
            usage: Mutex::new(ResourceUsage::default()),
            routers_created: AtomicUsize::new(0),
            routers: Mutex::new(Vec::new()),
            died: OnceListeners::new(),
            new_consumer: Arc::new(Listeners::new()),
        });
        debug!("memory engine started worker {}", pid);

        lock(&self.workers).push(worker.clone());
        Ok(worker)
    }
}

/// A worker that lives in this process
pub struct MemoryWorker {
    pid: u32,
    rtc_ports: Arc<AtomicU16>,
    closed: AtomicBool,
    listen_infos: Mutex<Option<Vec<ListenInfo>>>,
    fail_webrtc_server: bool,
    fail_resource_usage: AtomicBool,
    fail_router_creation: AtomicBool,
    usage: Mutex<ResourceUsage>,
    routers_created: AtomicUsize,
    routers: Mutex<Vec<Arc<MemoryRouter>>>,
    died: OnceListeners<String>,
    new_consumer: NewConsumerListeners,
}

impl MemoryWorker {
    /// Sets the cumulative CPU time the next `resource_usage` call reports
    pub fn set_cpu_time(&self, user: Duration, system: Duration) {
        *lock(&self.usage) = ResourceUsage {
            user_time: user,
            system_time: system,
        };
    }

    pub fn set_fail_resource_usage(&self, fail: bool) {
        self.fail_resource_usage.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_router_creation(&self, fail: bool) {
        self.fail_router_creation.store(fail, Ordering::SeqCst);
    }

    pub fn routers_created(&self) -> usize {
        self.routers_created.load(Ordering::SeqCst)
    }

    pub fn listen_infos(&self) -> Option<Vec<ListenInfo>> {
        lock(&self.listen_infos).clone()
    }

    pub fn routers(&self) -> Vec<Arc<MemoryRouter>> {
        lock(&self.routers).iter().filter(|r| !r.closed()).cloned().collect()
    }

    pub fn router(&self, id: &str) -> Option<Arc<MemoryRouter>> {
        lock(&self.routers).iter().find(|r| r.id() == id).cloned()
    }

    /// Simulates the process crashing
    pub fn kill(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for router in drain(&self.routers) {
            router.shutdown();
        }
        self.died.fire(reason.to_string());
    }
}

#[async_trait]
impl EngineWorker for MemoryWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn create_webrtc_server(&self, listen_infos: &[ListenInfo]) -> EngineResult<()> {
        if self.fail_webrtc_server {
            return Err(EngineError::Request("address already in use".to_string()));
        }
        *lock(&self.listen_infos) = Some(listen_infos.to_vec());
        Ok(())
    }

    async fn resource_usage(&self) -> EngineResult<ResourceUsage> {
        if EngineWorker::closed(self) {
            return Err(EngineError::Closed("worker"));
        }
        if self.fail_resource_usage.load(Ordering::SeqCst) {
            return Err(EngineError::Request("getrusage failed".to_string()));
        }
        Ok(*lock(&self.usage))
    }

    async fn create_router(&self, options: RouterOptions) -> EngineResult<Arc<dyn EngineRouter>> {
        tokio::task::yield_now().await;

        if EngineWorker::closed(self) {
            return Err(EngineError::Closed("worker"));
        }
        if self.fail_router_creation.load(Ordering::SeqCst) {
            return Err(EngineError::Request("router creation rejected".to_string()));
        }

        self.routers_created.fetch_add(1, Ordering::SeqCst);
        let router = Arc::new_cyclic(|me| MemoryRouter {
            core: ResourceCore::new(new_id()),
            me: me.clone(),
            worker_pid: self.pid,
            codecs: options.media_codecs,
            ports: self.rtc_ports.clone(),
            transports: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
            producers: Mutex::new(HashMap::new()),
            data_producers: Mutex::new(HashMap::new()),
            new_consumer: self.new_consumer.clone(),
        });
        track(&self.routers, router.clone());
        Ok(router)
    }

    fn on_died(&self, callback: Box<dyn FnOnce(String) + Send>) -> Subscription {
        self.died.add(callback)
    }

    fn on_new_consumer(&self, callback: Arc<dyn Fn(&Arc<dyn Consumer>) + Send + Sync>) -> Subscription {
        self.new_consumer.add(callback)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for router in drain(&self.routers) {
            router.shutdown();
        }
    }
}

pub struct MemoryRouter {
    core: ResourceCore,
    me: Weak<MemoryRouter>,
    worker_pid: u32,
    codecs: Vec<RtpCodecCapability>,
    ports: Arc<AtomicU16>,
    transports: Mutex<Vec<Arc<MemoryTransport>>>,
    observers: Mutex<Vec<Arc<MemoryObserver>>>,
    producers: Mutex<HashMap<String, Weak<MemoryProducer>>>,
    data_producers: Mutex<HashMap<String, Weak<MemoryDataProducer>>>,
    new_consumer: NewConsumerListeners,
}

impl_resource!(MemoryRouter);

impl MemoryRouter {
    pub fn worker_pid(&self) -> u32 {
        self.worker_pid
    }

    pub fn transports(&self) -> Vec<Arc<MemoryTransport>> {
        lock(&self.transports).iter().filter(|t| !t.closed()).cloned().collect()
    }

    pub fn producer(&self, id: &str) -> Option<Arc<MemoryProducer>> {
        lock(&self.producers)
            .get(id)
            .and_then(Weak::upgrade)
            .filter(|p| !p.closed())
    }

    pub fn consumer(&self, id: &str) -> Option<Arc<MemoryConsumer>> {
        self.transports()
            .iter()
            .flat_map(|t| lock(&t.consumers).clone())
            .find(|c| c.id() == id && !c.closed())
    }

    pub fn observer(&self, id: &str) -> Option<Arc<MemoryObserver>> {
        lock(&self.observers).iter().find(|o| o.id() == id && !o.closed()).cloned()
    }

    fn data_producer(&self, id: &str) -> Option<Arc<MemoryDataProducer>> {
        lock(&self.data_producers)
            .get(id)
            .and_then(Weak::upgrade)
            .filter(|p| !p.closed())
    }

    fn next_port(&self) -> u16 {
        self.ports.fetch_add(1, Ordering::SeqCst)
    }

    fn shutdown(&self) {
        if !self.core.begin_close() {
            return;
        }
        for transport in drain(&self.transports) {
            transport.shutdown();
        }
        for observer in drain(&self.observers) {
            observer.shutdown();
        }
        self.core.finish_close();
    }

    fn new_transport(&self, kind: TransportKind, params: Map<String, Value>) -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport {
            core: ResourceCore::new(new_id()),
            kind,
            router: self.me.clone(),
            params,
            connected: Mutex::new(None),
            max_incoming_bitrate: Mutex::new(None),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            data_producers: Mutex::new(Vec::new()),
            data_consumers: Mutex::new(Vec::new()),
        });
        track(&self.transports, transport.clone());
        transport
    }

    fn new_observer(&self) -> Arc<MemoryObserver> {
        let observer = Arc::new(MemoryObserver {
            core: ResourceCore::new(new_id()),
            router: self.me.clone(),
            producers: Mutex::new(Vec::new()),
            listeners: Listeners::new(),
        });
        track(&self.observers, observer.clone());
        observer
    }

    fn capabilities_cover(&self, kind: MediaKind, rtp_capabilities: &Value) -> bool {
        let prefix = match kind {
            MediaKind::Audio => "audio/",
            MediaKind::Video => "video/",
        };
        rtp_capabilities
            .get("codecs")
            .and_then(Value::as_array)
            .is_some_and(|codecs| {
                codecs.iter().any(|codec| {
                    codec
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .is_some_and(|mime| mime.to_ascii_lowercase().starts_with(prefix))
                })
            })
    }
}

#[async_trait]
impl EngineRouter for MemoryRouter {
    fn rtp_capabilities(&self) -> Value {
        let codecs: Vec<Value> = self
            .codecs
            .iter()
            .enumerate()
            .map(|(index, codec)| {
                let mut value = serde_json::to_value(codec).unwrap_or(Value::Null);
                if let Some(object) = value.as_object_mut() {
                    object.insert("preferredPayloadType".to_string(), json!(100 + index));
                }
                value
            })
            .collect();

        json!({
            "codecs": codecs,
            "headerExtensions": [
                { "kind": "audio", "uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "preferredId": 1 },
                { "kind": "video", "uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "preferredId": 1 },
                { "kind": "audio", "uri": "urn:ietf:params:rtp-hdrext:ssrc-audio-level", "preferredId": 10 },
                { "kind": "video", "uri": "urn:3gpp:video-orientation", "preferredId": 11 },
            ],
        })
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        self.producer(producer_id)
            .is_some_and(|producer| self.capabilities_cover(producer.kind, rtp_capabilities))
    }

    async fn create_webrtc_transport(&self, options: WebRtcTransportOptions) -> EngineResult<Arc<dyn Transport>> {
        tokio::task::yield_now().await;
        self.core.ensure_open("router")?;

        let port = self.next_port();
        let mut candidates = Vec::new();
        if options.enable_udp {
            candidates.push(json!({ "foundation": "udpcandidate", "ip": "127.0.0.1", "port": port, "protocol": "udp", "type": "host", "priority": 1_076_302_079u32 }));
        }
        if options.enable_tcp {
            candidates.push(json!({ "foundation": "tcpcandidate", "ip": "127.0.0.1", "port": port, "protocol": "tcp", "type": "host", "tcpType": "passive", "priority": 1_076_276_479u32 }));
        }

        let mut params = Map::new();
        params.insert("iceParameters".to_string(), ice_parameters());
        params.insert("iceCandidates".to_string(), Value::Array(candidates));
        params.insert(
            "dtlsParameters".to_string(),
            json!({ "role": "auto", "fingerprints": [{ "algorithm": "sha-256", "value": new_id() }] }),
        );
        let sctp = if options.enable_sctp {
            json!({ "port": 5000, "OS": options.num_sctp_streams.clone().unwrap_or(json!(1024)), "MIS": 1024, "maxMessageSize": 262_144 })
        } else {
            Value::Null
        };
        params.insert("sctpParameters".to_string(), sctp);

        Ok(self.new_transport(TransportKind::WebRtc, params))
    }

    async fn create_pipe_transport(&self, options: PipeTransportOptions) -> EngineResult<Arc<dyn Transport>> {
        tokio::task::yield_now().await;
        self.core.ensure_open("router")?;

        let mut params = Map::new();
        params.insert("ip".to_string(), json!(options.listen_info.ip.to_string()));
        params.insert("port".to_string(), json!(self.next_port()));
        params.insert("srtpParameters".to_string(), srtp_parameters(options.enable_srtp));

        Ok(self.new_transport(TransportKind::Pipe, params))
    }

    async fn create_plain_transport(&self, options: PlainTransportOptions) -> EngineResult<Arc<dyn Transport>> {
        tokio::task::yield_now().await;
        self.core.ensure_open("router")?;

        let mut params = Map::new();
        params.insert("ip".to_string(), json!(options.listen_info.ip.to_string()));
        params.insert("port".to_string(), json!(self.next_port()));
        let rtcp_port = if options.rtcp_mux { Value::Null } else { json!(self.next_port()) };
        params.insert("rtcpPort".to_string(), rtcp_port);
        params.insert("srtpParameters".to_string(), srtp_parameters(options.enable_srtp));

        Ok(self.new_transport(TransportKind::Plain, params))
    }

    async fn create_active_speaker_observer(
        &self,
        _options: ActiveSpeakerObserverOptions,
    ) -> EngineResult<Arc<dyn RtpObserver>> {
        self.core.ensure_open("router")?;
        Ok(self.new_observer())
    }

    async fn create_audio_level_observer(
        &self,
        _options: AudioLevelObserverOptions,
    ) -> EngineResult<Arc<dyn RtpObserver>> {
        self.core.ensure_open("router")?;
        Ok(self.new_observer())
    }
}

fn ice_parameters() -> Value {
    json!({ "usernameFragment": new_id(), "password": new_id(), "iceLite": true })
}

fn srtp_parameters(enabled: bool) -> Value {
    if enabled {
        json!({ "cryptoSuite": "AEAD_AES_256_GCM", "keyBase64": new_id() })
    } else {
        Value::Null
    }
}

pub struct MemoryTransport {
    core: ResourceCore,
    kind: TransportKind,
    router: Weak<MemoryRouter>,
    params: Map<String, Value>,
    connected: Mutex<Option<Value>>,
    max_incoming_bitrate: Mutex<Option<u32>>,
    producers: Mutex<Vec<Arc<MemoryProducer>>>,
    consumers: Mutex<Vec<Arc<MemoryConsumer>>>,
    data_producers: Mutex<Vec<Arc<MemoryDataProducer>>>,
    data_consumers: Mutex<Vec<Arc<MemoryDataConsumer>>>,
}

impl_resource!(MemoryTransport);

impl MemoryTransport {
    pub fn connected_with(&self) -> Option<Value> {
        lock(&self.connected).clone()
    }

    pub fn max_incoming_bitrate(&self) -> Option<u32> {
        *lock(&self.max_incoming_bitrate)
    }

    fn router(&self) -> EngineResult<Arc<MemoryRouter>> {
        self.router.upgrade().ok_or(EngineError::Closed("router"))
    }

    fn shutdown(&self) {
        if !self.core.begin_close() {
            return;
        }
        for consumer in drain(&self.consumers) {
            consumer.shutdown();
        }
        for producer in drain(&self.producers) {
            producer.shutdown();
        }
        for consumer in drain(&self.data_consumers) {
            consumer.shutdown();
        }
        for producer in drain(&self.data_producers) {
            producer.shutdown();
        }
        self.core.finish_close();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn parameters(&self) -> Map<String, Value> {
        self.params.clone()
    }

    async fn connect(&self, parameters: Value) -> EngineResult<()> {
        self.core.ensure_open("transport")?;
        let mut connected = lock(&self.connected);
        if connected.is_some() {
            return Err(EngineError::Request("connect() already called".to_string()));
        }
        *connected = Some(parameters);
        Ok(())
    }

    async fn restart_ice(&self) -> EngineResult<Value> {
        self.core.ensure_open("transport")?;
        if self.kind != TransportKind::WebRtc {
            return Err(EngineError::InvalidParameters("ICE restart on a non-WebRTC transport".to_string()));
        }
        Ok(ice_parameters())
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> EngineResult<()> {
        self.core.ensure_open("transport")?;
        *lock(&self.max_incoming_bitrate) = Some(bitrate);
        Ok(())
    }

    async fn produce(&self, options: ProducerOptions) -> EngineResult<Arc<dyn Producer>> {
        tokio::task::yield_now().await;
        self.core.ensure_open("transport")?;
        if !options.rtp_parameters.is_object() {
            return Err(EngineError::InvalidParameters("rtpParameters must be an object".to_string()));
        }

        let router = self.router()?;
        let id = options.id.unwrap_or_else(new_id);
        if router.producer(&id).is_some() {
            return Err(EngineError::Request(format!("a Producer with same id \"{id}\" already exists")));
        }

        let producer = Arc::new(MemoryProducer {
            core: ResourceCore::new(id.clone()),
            kind: options.kind,
            rtp_parameters: options.rtp_parameters,
            paused: AtomicBool::new(options.paused),
            consumers: Mutex::new(Vec::new()),
            listeners: Listeners::new(),
        });
        lock(&router.producers).insert(id, Arc::downgrade(&producer));
        track(&self.producers, producer.clone());
        Ok(producer)
    }

    async fn consume(&self, options: ConsumerOptions) -> EngineResult<Arc<dyn Consumer>> {
        tokio::task::yield_now().await;
        self.core.ensure_open("transport")?;

        let router = self.router()?;
        let producer = router.producer(&options.producer_id).ok_or_else(|| EngineError::Unknown {
            kind: "producer",
            id: options.producer_id.clone(),
        })?;
        if let Some(capabilities) = &options.rtp_capabilities {
            if !router.capabilities_cover(producer.kind, capabilities) {
                return Err(EngineError::Request("cannot consume with given rtpCapabilities".to_string()));
            }
        }

        let consumer = Arc::new(MemoryConsumer {
            core: ResourceCore::new(new_id()),
            producer_id: options.producer_id,
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
            paused: AtomicBool::new(options.paused),
            producer_paused: AtomicBool::new(producer.paused.load(Ordering::SeqCst)),
            preferred_layers: Mutex::new(None),
            priority: Mutex::new(1),
            key_frames_requested: AtomicUsize::new(0),
            listeners: Listeners::new(),
        });
        track(&producer.consumers, consumer.clone());
        track(&self.consumers, consumer.clone());

        let announced: Arc<dyn Consumer> = consumer.clone();
        router.new_consumer.emit(&announced);
        Ok(consumer)
    }

    async fn produce_data(&self, options: DataProducerOptions) -> EngineResult<Arc<dyn DataProducer>> {
        self.core.ensure_open("transport")?;

        let router = self.router()?;
        let id = options.id.unwrap_or_else(new_id);
        if router.data_producer(&id).is_some() {
            return Err(EngineError::Request(format!("a DataProducer with same id \"{id}\" already exists")));
        }

        let producer = Arc::new(MemoryDataProducer {
            core: ResourceCore::new(id.clone()),
            label: options.label,
            protocol: options.protocol,
            sctp_stream_parameters: options.sctp_stream_parameters,
            consumers: Mutex::new(Vec::new()),
        });
        lock(&router.data_producers).insert(id, Arc::downgrade(&producer));
        track(&self.data_producers, producer.clone());
        Ok(producer)
    }

    async fn consume_data(&self, options: DataConsumerOptions) -> EngineResult<Arc<dyn DataConsumer>> {
        self.core.ensure_open("transport")?;

        let router = self.router()?;
        let producer = router.data_producer(&options.data_producer_id).ok_or_else(|| EngineError::Unknown {
            kind: "data producer",
            id: options.data_producer_id.clone(),
        })?;

        let consumer = Arc::new(MemoryDataConsumer {
            core: ResourceCore::new(new_id()),
            data_producer_id: options.data_producer_id,
            label: producer.label.clone(),
            protocol: producer.protocol.clone(),
            sctp_stream_parameters: producer.sctp_stream_parameters.clone(),
        });
        track(&producer.consumers, consumer.clone());
        track(&self.data_consumers, consumer.clone());
        Ok(consumer)
    }
}

pub struct MemoryProducer {
    core: ResourceCore,
    kind: MediaKind,
    rtp_parameters: Value,
    paused: AtomicBool,
    consumers: Mutex<Vec<Arc<MemoryConsumer>>>,
    listeners: Listeners<ProducerEvent>,
}

impl_resource!(MemoryProducer);

impl MemoryProducer {
    pub fn emit_score(&self, score: Value) {
        self.listeners.emit(&ProducerEvent::Score(score));
    }

    fn shutdown(&self) {
        if !self.core.begin_close() {
            return;
        }
        for consumer in drain(&self.consumers) {
            consumer.shutdown();
        }
        self.core.finish_close();
    }

    fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::SeqCst) == paused {
            return;
        }
        let consumers = lock(&self.consumers).clone();
        for consumer in consumers {
            consumer.producer_paused.store(paused, Ordering::SeqCst);
            let event = if paused { ConsumerEvent::ProducerPause } else { ConsumerEvent::ProducerResume };
            consumer.listeners.emit(&event);
        }
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> EngineResult<()> {
        self.core.ensure_open("producer")?;
        self.set_paused(true);
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        self.core.ensure_open("producer")?;
        self.set_paused(false);
        Ok(())
    }

    fn on_event(&self, callback: Arc<dyn Fn(&ProducerEvent) + Send + Sync>) -> Subscription {
        self.listeners.add(callback)
    }
}

pub struct MemoryConsumer {
    core: ResourceCore,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    paused: AtomicBool,
    producer_paused: AtomicBool,
    preferred_layers: Mutex<Option<ConsumerLayers>>,
    priority: Mutex<u8>,
    key_frames_requested: AtomicUsize,
    listeners: Listeners<ConsumerEvent>,
}

impl_resource!(MemoryConsumer);

impl MemoryConsumer {
    pub fn preferred_layers(&self) -> Option<ConsumerLayers> {
        *lock(&self.preferred_layers)
    }

    pub fn priority(&self) -> u8 {
        *lock(&self.priority)
    }

    pub fn key_frames_requested(&self) -> usize {
        self.key_frames_requested.load(Ordering::SeqCst)
    }

    pub fn emit_score(&self, score: Value) {
        self.listeners.emit(&ConsumerEvent::Score(score));
    }

    fn shutdown(&self) {
        if self.core.begin_close() {
            self.core.finish_close();
        }
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused.load(Ordering::SeqCst)
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    async fn pause(&self) -> EngineResult<()> {
        self.core.ensure_open("consumer")?;
        if !self.paused.swap(true, Ordering::SeqCst) {
            self.listeners.emit(&ConsumerEvent::Pause);
        }
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        self.core.ensure_open("consumer")?;
        if self.paused.swap(false, Ordering::SeqCst) {
            self.listeners.emit(&ConsumerEvent::Resume);
        }
        Ok(())
    }

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> EngineResult<()> {
        self.core.ensure_open("consumer")?;
        *lock(&self.preferred_layers) = Some(layers);
        self.listeners.emit(&ConsumerEvent::LayersChange(Some(layers)));
        Ok(())
    }

    async fn set_priority(&self, priority: u8) -> EngineResult<()> {
        self.core.ensure_open("consumer")?;
        if priority == 0 {
            return Err(EngineError::InvalidParameters("priority must be positive".to_string()));
        }
        *lock(&self.priority) = priority;
        Ok(())
    }

    async fn request_key_frame(&self) -> EngineResult<()> {
        self.core.ensure_open("consumer")?;
        self.key_frames_requested.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_event(&self, callback: Arc<dyn Fn(&ConsumerEvent) + Send + Sync>) -> Subscription {
        self.listeners.add(callback)
    }
}

pub struct MemoryDataProducer {
    core: ResourceCore,
    label: String,
    protocol: String,
    sctp_stream_parameters: Option<Value>,
    consumers: Mutex<Vec<Arc<MemoryDataConsumer>>>,
}

impl_resource!(MemoryDataProducer);

impl MemoryDataProducer {
    fn shutdown(&self) {
        if !self.core.begin_close() {
            return;
        }
        for consumer in drain(&self.consumers) {
            consumer.shutdown();
        }
        self.core.finish_close();
    }
}

impl DataProducer for MemoryDataProducer {
    fn label(&self) -> &str {
        &self.label
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }
}

pub struct MemoryDataConsumer {
    core: ResourceCore,
    data_producer_id: String,
    label: String,
    protocol: String,
    sctp_stream_parameters: Option<Value>,
}

impl_resource!(MemoryDataConsumer);

impl MemoryDataConsumer {
    fn shutdown(&self) {
        if self.core.begin_close() {
            self.core.finish_close();
        }
    }
}

impl DataConsumer for MemoryDataConsumer {
    fn data_producer_id(&self) -> &str {
        &self.data_producer_id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn sctp_stream_parameters(&self) -> Option<Value> {
        self.sctp_stream_parameters.clone()
    }
}

pub struct MemoryObserver {
    core: ResourceCore,
    router: Weak<MemoryRouter>,
    producers: Mutex<Vec<String>>,
    listeners: Listeners<RtpObserverEvent>,
}

impl_resource!(MemoryObserver);

impl MemoryObserver {
    pub fn producers(&self) -> Vec<String> {
        lock(&self.producers).clone()
    }

    pub fn emit_dominant_speaker(&self, producer_id: &str) {
        self.listeners.emit(&RtpObserverEvent::DominantSpeaker {
            producer_id: producer_id.to_string(),
        });
    }

    pub fn emit_volumes(&self, volumes: Vec<AudioLevel>) {
        self.listeners.emit(&RtpObserverEvent::Volumes(volumes));
    }

    fn shutdown(&self) {
        if self.core.begin_close() {
            self.core.finish_close();
        }
    }
}

#[async_trait]
impl RtpObserver for MemoryObserver {
    async fn add_producer(&self, producer_id: &str) -> EngineResult<()> {
        self.core.ensure_open("rtp observer")?;
        let router = self.router.upgrade().ok_or(EngineError::Closed("router"))?;
        if router.producer(producer_id).is_none() {
            return Err(EngineError::Unknown {
                kind: "producer",
                id: producer_id.to_string(),
            });
        }
        let mut producers = lock(&self.producers);
        if !producers.iter().any(|p| p == producer_id) {
            producers.push(producer_id.to_string());
        }
        Ok(())
    }

    async fn remove_producer(&self, producer_id: &str) -> EngineResult<()> {
        self.core.ensure_open("rtp observer")?;
        lock(&self.producers).retain(|p| p != producer_id);
        Ok(())
    }

    fn on_event(&self, callback: Arc<dyn Fn(&RtpObserverEvent) + Send + Sync>) -> Subscription {
        self.listeners.add(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Protocol, WorkerLogLevel};
    use std::net::{IpAddr, Ipv4Addr};

    fn settings() -> WorkerSettings {
        WorkerSettings {
            log_level: WorkerLogLevel::Warn,
            log_tags: Vec::new(),
            rtc_port_range: 40000..=49999,
        }
    }

    fn listen_info() -> ListenInfo {
        ListenInfo {
            protocol: Protocol::Udp,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_address: None,
        }
    }

    async fn router() -> (Arc<MemoryWorker>, Arc<dyn EngineRouter>) {
        let engine = MemoryEngine::new();
        let worker = engine.create_worker(&settings()).await.unwrap();
        let router = worker
            .create_router(RouterOptions { media_codecs: Vec::new() })
            .await
            .unwrap();
        (engine.worker(worker.pid()).unwrap(), router)
    }

    #[tokio::test]
    async fn closing_router_cascades_to_children() {
        let (_worker, router) = router().await;
        let transport = router
            .create_pipe_transport(PipeTransportOptions {
                listen_info: listen_info(),
                enable_sctp: false,
                enable_rtx: false,
                enable_srtp: false,
            })
            .await
            .unwrap();
        let producer = transport
            .produce(ProducerOptions {
                id: None,
                kind: MediaKind::Audio,
                rtp_parameters: json!({}),
                paused: false,
                app_data: Value::Null,
            })
            .await
            .unwrap();

        let closed = Arc::new(AtomicUsize::new(0));
        let _sub = producer.on_close({
            let closed = closed.clone();
            Box::new(move || {
                closed.fetch_add(1, Ordering::SeqCst);
            })
        });

        router.close();
        router.close();

        assert!(transport.closed());
        assert!(producer.closed());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn killing_worker_fires_died_once() {
        let (worker, router) = router().await;
        let reason = Arc::new(Mutex::new(None));
        let _sub = worker.on_died({
            let reason = reason.clone();
            Box::new(move |r| {
                *reason.lock().unwrap() = Some(r);
            })
        });

        worker.kill("segfault");
        worker.kill("again");

        assert!(router.closed());
        assert_eq!(reason.lock().unwrap().as_deref(), Some("segfault"));
    }
}

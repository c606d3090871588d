#![forbid(unsafe_code)]

// Engine backed by mediasoup workers
//
// Every adapter owns one mediasoup handle. Dropping that handle is what closes the object
// inside the worker, so `close` takes it out, and children follow their parent's close.

use crate::engine::{
    self, ActiveSpeakerObserverOptions, AudioLevel, AudioLevelObserverOptions, ConsumerEvent, ConsumerLayers,
    ConsumerOptions, DataConsumerOptions, DataProducerOptions, EngineError, EngineResult, ListenInfo, Listeners,
    MediaKind, OnceListeners, PipeTransportOptions, PlainTransportOptions, ProducerEvent, ProducerOptions, Protocol,
    Resource, ResourceUsage, RouterOptions, RtpObserverEvent, Subscription, TransportKind, WebRtcTransportOptions,
    WorkerLogLevel, WorkerSettings,
};
use ::mediasoup::active_speaker_observer::{ActiveSpeakerObserver, ActiveSpeakerObserverOptions as MsActiveSpeakerOptions};
use ::mediasoup::audio_level_observer::{AudioLevelObserver, AudioLevelObserverOptions as MsAudioLevelOptions};
use ::mediasoup::prelude as ms;
use ::mediasoup::prelude::Transport as _;
use ::mediasoup::rtp_observer::{RtpObserver as _, RtpObserverAddProducerOptions};
use ::mediasoup::webrtc_server::WebRtcServer;
use ::mediasoup::worker::{WorkerLogLevel as MsLogLevel, WorkerLogTag, WorkerSettings as MsWorkerSettings};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;
use std::num::NonZeroU16;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

type NewConsumerListeners = Arc<Listeners<Arc<dyn engine::Consumer>>>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn request_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Request(e.to_string())
}

fn to_json(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Peer-supplied parameters into mediasoup's typed form
fn decode<T: DeserializeOwned>(what: &str, value: Value) -> EngineResult<T> {
    serde_json::from_value(value).map_err(|e| EngineError::InvalidParameters(format!("{what}: {e}")))
}

fn parse_id<T: DeserializeOwned>(kind: &'static str, id: &str) -> EngineResult<T> {
    serde_json::from_value(Value::String(id.to_string())).map_err(|_| EngineError::Unknown {
        kind,
        id: id.to_string(),
    })
}

fn log_level(level: WorkerLogLevel) -> MsLogLevel {
    match level {
        WorkerLogLevel::Debug => MsLogLevel::Debug,
        WorkerLogLevel::Warn => MsLogLevel::Warn,
        WorkerLogLevel::Error => MsLogLevel::Error,
        WorkerLogLevel::None => MsLogLevel::None,
    }
}

fn log_tag(tag: &str) -> Option<WorkerLogTag> {
    let tag = match tag {
        "info" => WorkerLogTag::Info,
        "ice" => WorkerLogTag::Ice,
        "dtls" => WorkerLogTag::Dtls,
        "rtp" => WorkerLogTag::Rtp,
        "srtp" => WorkerLogTag::Srtp,
        "rtcp" => WorkerLogTag::Rtcp,
        "rtx" => WorkerLogTag::Rtx,
        "bwe" => WorkerLogTag::Bwe,
        "score" => WorkerLogTag::Score,
        "simulcast" => WorkerLogTag::Simulcast,
        "svc" => WorkerLogTag::Svc,
        "sctp" => WorkerLogTag::Sctp,
        other => {
            warn!("Ignoring unknown worker log tag {}", other);
            return None;
        }
    };
    Some(tag)
}

fn listen_info(info: &ListenInfo) -> ms::ListenInfo {
    ms::ListenInfo {
        protocol: match info.protocol {
            Protocol::Udp => ms::Protocol::Udp,
            Protocol::Tcp => ms::Protocol::Tcp,
        },
        ip: info.ip,
        announced_address: info.announced_address.clone(),
        port: None,
        port_range: None,
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
    }
}

fn media_kind(kind: MediaKind) -> ms::MediaKind {
    match kind {
        MediaKind::Audio => ms::MediaKind::Audio,
        MediaKind::Video => ms::MediaKind::Video,
    }
}

fn from_media_kind(kind: ms::MediaKind) -> MediaKind {
    match kind {
        ms::MediaKind::Audio => MediaKind::Audio,
        ms::MediaKind::Video => MediaKind::Video,
    }
}

/// Local address and port of a serialized transport tuple
fn tuple_address(tuple: &Value) -> (Value, Value) {
    let ip = tuple
        .get("localAddress")
        .or_else(|| tuple.get("localIp"))
        .cloned()
        .unwrap_or(Value::Null);
    let port = tuple.get("localPort").cloned().unwrap_or(Value::Null);
    (ip, port)
}

/// The mediasoup handle behind an adapter plus its close bookkeeping
struct Handle<T> {
    id: String,
    inner: Mutex<Option<T>>,
    closed: AtomicBool,
    close_listeners: OnceListeners<()>,
    parent: Mutex<Option<Subscription>>,
}

impl<T: Clone> Handle<T> {
    fn new(id: String, inner: T) -> Self {
        Self {
            id,
            inner: Mutex::new(Some(inner)),
            closed: AtomicBool::new(false),
            close_listeners: OnceListeners::new(),
            parent: Mutex::new(None),
        }
    }

    fn get(&self, what: &'static str) -> EngineResult<T> {
        lock(&self.inner).clone().ok_or(EngineError::Closed(what))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Keeps the subscription that closes this adapter along with its parent
    fn follow(&self, parent: Subscription) {
        if self.is_closed() {
            return;
        }
        *lock(&self.parent) = Some(parent);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = lock(&self.inner).take();
        let parent = lock(&self.parent).take();
        drop(inner);
        drop(parent);
        self.close_listeners.fire(());
    }

    fn on_close(&self, callback: Box<dyn FnOnce() + Send>) -> Subscription {
        self.close_listeners.add(Box::new(move |()| callback()))
    }
}

/// Subscription that closes `child` once `parent` closes
fn close_with<T: Clone, C: Resource + 'static>(parent: &Handle<T>, child: &Arc<C>) -> Subscription {
    let child = Arc::downgrade(child);
    parent.on_close(Box::new(move || {
        if let Some(child) = child.upgrade() {
            child.close();
        }
    }))
}

/// Callback for mediasoup's own close event, for closes the worker initiates
fn mirror_close<C: Resource + 'static>(child: &Arc<C>) -> Box<dyn FnOnce() + Send> {
    let child: Weak<C> = Arc::downgrade(child);
    Box::new(move || {
        if let Some(child) = child.upgrade() {
            child.close();
        }
    })
}

macro_rules! impl_resource {
    ($ty:ty) => {
        impl Resource for $ty {
            fn id(&self) -> &str {
                &self.handle.id
            }

            fn closed(&self) -> bool {
                self.handle.is_closed()
            }

            fn close(&self) {
                self.handle.close();
            }

            fn on_close(&self, callback: Box<dyn FnOnce() + Send>) -> Subscription {
                self.handle.on_close(callback)
            }
        }
    };
}

/// Spawns mediasoup workers as threads of this process
pub struct MediasoupEngine {
    manager: ms::WorkerManager,
    next_pid: AtomicU32,
}

impl MediasoupEngine {
    pub fn new() -> Self {
        Self {
            manager: ms::WorkerManager::new(),
            next_pid: AtomicU32::new(1),
        }
    }
}

impl Default for MediasoupEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl engine::MediaEngine for MediasoupEngine {
    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn engine::EngineWorker>> {
        let mut worker_settings = MsWorkerSettings::default();
        worker_settings.log_level = log_level(settings.log_level);
        worker_settings.log_tags = settings.log_tags.iter().filter_map(|tag| log_tag(tag)).collect();
        worker_settings.rtc_port_range = settings.rtc_port_range.clone();

        let worker = self
            .manager
            .create_worker(worker_settings)
            .await
            .map_err(request_error)?;

        // Workers are threads here, so the pid is a sequence number
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        debug!("mediasoup worker {} started [id: {}]", pid, worker.id());

        Ok(MediasoupWorker::new(pid, worker))
    }
}

pub struct MediasoupWorker {
    pid: u32,
    worker: Mutex<Option<ms::Worker>>,
    webrtc_server: Mutex<Option<WebRtcServer>>,
    closed: AtomicBool,
    closing: OnceListeners<()>,
    died: OnceListeners<String>,
    new_consumer: NewConsumerListeners,
}

impl MediasoupWorker {
    fn new(pid: u32, worker: ms::Worker) -> Arc<Self> {
        let adapter = Arc::new(Self {
            pid,
            worker: Mutex::new(Some(worker.clone())),
            webrtc_server: Mutex::new(None),
            closed: AtomicBool::new(false),
            closing: OnceListeners::new(),
            died: OnceListeners::new(),
            new_consumer: Arc::new(Listeners::new()),
        });

        let weak = Arc::downgrade(&adapter);
        worker
            .on_dead(move |reason| {
                if let Some(adapter) = weak.upgrade() {
                    adapter.die(format!("{reason:?}"));
                }
            })
            .detach();

        adapter
    }

    fn handle(&self) -> EngineResult<ms::Worker> {
        lock(&self.worker).clone().ok_or(EngineError::Closed("worker"))
    }

    fn die(&self, reason: String) {
        error!("mediasoup worker {} died: {}", self.pid, reason);
        self.shutdown();
        self.died.fire(reason);
    }

    /// Closes every router, then releases the worker
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closing.fire(());
        drop(lock(&self.webrtc_server).take());
        drop(lock(&self.worker).take());
    }
}

#[async_trait]
impl engine::EngineWorker for MediasoupWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn create_webrtc_server(&self, listen_infos: &[ListenInfo]) -> EngineResult<()> {
        let worker = self.handle()?;

        let mut infos = listen_infos.iter().map(listen_info);
        let first = infos
            .next()
            .ok_or_else(|| EngineError::InvalidParameters("no listen address configured".to_string()))?;
        let server_infos = infos.fold(ms::WebRtcServerListenInfos::new(first), |all, info| all.insert(info));

        let server = worker
            .create_webrtc_server(ms::WebRtcServerOptions::new(server_infos))
            .await
            .map_err(request_error)?;
        debug!("WebRtcServer {} created on worker {}", server.id(), self.pid);

        *lock(&self.webrtc_server) = Some(server);
        Ok(())
    }

    async fn resource_usage(&self) -> EngineResult<ResourceUsage> {
        let worker = self.handle()?;
        let usage = worker.get_resource_usage().await.map_err(request_error)?;

        Ok(ResourceUsage {
            user_time: Duration::from_millis(usage.ru_utime),
            system_time: Duration::from_millis(usage.ru_stime),
        })
    }

    async fn create_router(&self, options: RouterOptions) -> EngineResult<Arc<dyn engine::EngineRouter>> {
        let worker = self.handle()?;
        let media_codecs = options
            .media_codecs
            .iter()
            .map(|codec| decode("mediaCodecs", to_json(codec)))
            .collect::<EngineResult<Vec<_>>>()?;

        let router = worker
            .create_router(ms::RouterOptions::new(media_codecs))
            .await
            .map_err(request_error)?;

        let adapter = MediasoupRouter::new(
            router,
            lock(&self.webrtc_server).clone(),
            self.new_consumer.clone(),
        );
        let router_adapter = Arc::downgrade(&adapter);
        adapter.handle.follow(self.closing.add(Box::new(move |()| {
            if let Some(router) = router_adapter.upgrade() {
                router.close();
            }
        })));
        Ok(adapter)
    }

    fn on_died(&self, callback: Box<dyn FnOnce(String) + Send>) -> Subscription {
        self.died.add(callback)
    }

    fn on_new_consumer(&self, callback: Arc<dyn Fn(&Arc<dyn engine::Consumer>) + Send + Sync>) -> Subscription {
        self.new_consumer.add(callback)
    }

    fn close(&self) {
        self.shutdown();
    }
}

pub struct MediasoupRouter {
    handle: Handle<ms::Router>,
    rtp_capabilities: Value,
    webrtc_server: Option<WebRtcServer>,
    new_consumer: NewConsumerListeners,
}

impl_resource!(MediasoupRouter);

impl MediasoupRouter {
    fn new(
        router: ms::Router,
        webrtc_server: Option<WebRtcServer>,
        new_consumer: NewConsumerListeners,
    ) -> Arc<Self> {
        let adapter = Arc::new(Self {
            handle: Handle::new(router.id().to_string(), router.clone()),
            rtp_capabilities: to_json(router.rtp_capabilities()),
            webrtc_server,
            new_consumer,
        });
        router.on_close(mirror_close(&adapter)).detach();
        adapter
    }

    fn adopt_transport(&self, transport: TransportHandle, kind: TransportKind, parameters: Map<String, Value>) -> Arc<dyn engine::Transport> {
        let adapter = Arc::new(MediasoupTransport {
            handle: Handle::new(transport.id(), transport.clone()),
            kind,
            parameters,
            new_consumer: self.new_consumer.clone(),
        });
        transport.on_close(mirror_close(&adapter));
        adapter.handle.follow(close_with(&self.handle, &adapter));
        adapter
    }

    fn adopt_observer(&self, observer: ObserverHandle) -> Arc<dyn engine::RtpObserver> {
        let adapter = Arc::new(MediasoupObserver {
            handle: Handle::new(observer.id(), observer.clone()),
            listeners: Arc::new(Listeners::new()),
        });
        observer.forward_events(Arc::downgrade(&adapter.listeners));
        observer.on_close(mirror_close(&adapter));
        adapter.handle.follow(close_with(&self.handle, &adapter));
        adapter
    }
}

#[async_trait]
impl engine::EngineRouter for MediasoupRouter {
    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(router) = self.handle.get("router") else { return false };
        let Ok(producer_id) = parse_id::<ms::ProducerId>("producer", producer_id) else { return false };
        let Ok(capabilities) = decode::<ms::RtpCapabilities>("rtpCapabilities", rtp_capabilities.clone()) else {
            return false;
        };
        router.can_consume(&producer_id, &capabilities)
    }

    async fn create_webrtc_transport(&self, options: WebRtcTransportOptions) -> EngineResult<Arc<dyn engine::Transport>> {
        let router = self.handle.get("router")?;
        let server = self
            .webrtc_server
            .clone()
            .ok_or_else(|| EngineError::Request("worker has no WebRtcServer".to_string()))?;

        let mut transport_options = ms::WebRtcTransportOptions::new_with_server(server);
        transport_options.enable_udp = options.enable_udp;
        transport_options.enable_tcp = options.enable_tcp;
        transport_options.prefer_udp = options.prefer_udp;
        transport_options.enable_sctp = options.enable_sctp;
        if let Some(streams) = options.num_sctp_streams {
            transport_options.num_sctp_streams = decode("numSctpStreams", streams)?;
        }
        transport_options.initial_available_outgoing_bitrate = options.initial_available_outgoing_bitrate;

        let transport = router
            .create_webrtc_transport(transport_options)
            .await
            .map_err(request_error)?;

        let mut parameters = Map::new();
        parameters.insert("iceParameters".to_string(), to_json(transport.ice_parameters()));
        parameters.insert("iceCandidates".to_string(), to_json(transport.ice_candidates()));
        parameters.insert("dtlsParameters".to_string(), to_json(transport.dtls_parameters()));
        parameters.insert("sctpParameters".to_string(), to_json(transport.sctp_parameters()));

        Ok(self.adopt_transport(TransportHandle::WebRtc(transport), TransportKind::WebRtc, parameters))
    }

    async fn create_pipe_transport(&self, options: PipeTransportOptions) -> EngineResult<Arc<dyn engine::Transport>> {
        let router = self.handle.get("router")?;

        let mut transport_options = ms::PipeTransportOptions::new(listen_info(&options.listen_info));
        transport_options.enable_sctp = options.enable_sctp;
        transport_options.enable_rtx = options.enable_rtx;
        transport_options.enable_srtp = options.enable_srtp;

        let transport = router
            .create_pipe_transport(transport_options)
            .await
            .map_err(request_error)?;

        let (ip, port) = tuple_address(&to_json(transport.tuple()));
        let mut parameters = Map::new();
        parameters.insert("ip".to_string(), ip);
        parameters.insert("port".to_string(), port);
        parameters.insert("srtpParameters".to_string(), to_json(transport.srtp_parameters()));

        Ok(self.adopt_transport(TransportHandle::Pipe(transport), TransportKind::Pipe, parameters))
    }

    async fn create_plain_transport(&self, options: PlainTransportOptions) -> EngineResult<Arc<dyn engine::Transport>> {
        let router = self.handle.get("router")?;

        let mut transport_options = ms::PlainTransportOptions::new(listen_info(&options.listen_info));
        transport_options.rtcp_mux = options.rtcp_mux;
        transport_options.comedia = options.comedia;
        transport_options.enable_srtp = options.enable_srtp;

        let transport = router
            .create_plain_transport(transport_options)
            .await
            .map_err(request_error)?;

        let (ip, port) = tuple_address(&to_json(transport.tuple()));
        let (_, rtcp_port) = tuple_address(&to_json(transport.rtcp_tuple()));
        let mut parameters = Map::new();
        parameters.insert("ip".to_string(), ip);
        parameters.insert("port".to_string(), port);
        parameters.insert("rtcpPort".to_string(), rtcp_port);
        parameters.insert("srtpParameters".to_string(), to_json(transport.srtp_parameters()));

        Ok(self.adopt_transport(TransportHandle::Plain(transport), TransportKind::Plain, parameters))
    }

    async fn create_active_speaker_observer(
        &self,
        options: ActiveSpeakerObserverOptions,
    ) -> EngineResult<Arc<dyn engine::RtpObserver>> {
        let router = self.handle.get("router")?;

        let mut observer_options = MsActiveSpeakerOptions::default();
        observer_options.interval = options.interval;

        let observer = router
            .create_active_speaker_observer(observer_options)
            .await
            .map_err(request_error)?;
        Ok(self.adopt_observer(ObserverHandle::ActiveSpeaker(observer)))
    }

    async fn create_audio_level_observer(
        &self,
        options: AudioLevelObserverOptions,
    ) -> EngineResult<Arc<dyn engine::RtpObserver>> {
        let router = self.handle.get("router")?;

        let mut observer_options = MsAudioLevelOptions::default();
        observer_options.max_entries = NonZeroU16::new(options.max_entries)
            .ok_or_else(|| EngineError::InvalidParameters("maxEntries must be positive".to_string()))?;
        observer_options.threshold = options.threshold;
        observer_options.interval = options.interval;

        let observer = router
            .create_audio_level_observer(observer_options)
            .await
            .map_err(request_error)?;
        Ok(self.adopt_observer(ObserverHandle::AudioLevel(observer)))
    }
}

#[derive(Clone)]
enum TransportHandle {
    WebRtc(ms::WebRtcTransport),
    Pipe(ms::PipeTransport),
    Plain(ms::PlainTransport),
}

macro_rules! with_transport {
    ($handle:expr, $transport:ident => $body:expr) => {
        match $handle {
            TransportHandle::WebRtc($transport) => $body,
            TransportHandle::Pipe($transport) => $body,
            TransportHandle::Plain($transport) => $body,
        }
    };
}

impl TransportHandle {
    fn id(&self) -> String {
        with_transport!(self, transport => transport.id().to_string())
    }

    fn on_close(&self, callback: Box<dyn FnOnce() + Send>) {
        with_transport!(self, transport => transport.on_close(callback).detach())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebRtcRemote {
    dtls_parameters: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipeRemote {
    ip: IpAddr,
    port: u16,
    #[serde(default)]
    srtp_parameters: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlainRemote {
    #[serde(default)]
    ip: Option<IpAddr>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    rtcp_port: Option<u16>,
    #[serde(default)]
    srtp_parameters: Option<Value>,
}

fn srtp<T: DeserializeOwned>(parameters: Option<Value>) -> EngineResult<Option<T>> {
    parameters
        .filter(|value| !value.is_null())
        .map(|value| decode("srtpParameters", value))
        .transpose()
}

pub struct MediasoupTransport {
    handle: Handle<TransportHandle>,
    kind: TransportKind,
    parameters: Map<String, Value>,
    new_consumer: NewConsumerListeners,
}

impl_resource!(MediasoupTransport);

#[async_trait]
impl engine::Transport for MediasoupTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn parameters(&self) -> Map<String, Value> {
        self.parameters.clone()
    }

    async fn connect(&self, parameters: Value) -> EngineResult<()> {
        match self.handle.get("transport")? {
            TransportHandle::WebRtc(transport) => {
                let remote: WebRtcRemote = decode("connect parameters", parameters)?;
                transport
                    .connect(ms::WebRtcTransportRemoteParameters {
                        dtls_parameters: decode("dtlsParameters", remote.dtls_parameters)?,
                    })
                    .await
                    .map_err(request_error)
            }
            TransportHandle::Pipe(transport) => {
                let remote: PipeRemote = decode("connect parameters", parameters)?;
                transport
                    .connect(ms::PipeTransportRemoteParameters {
                        ip: remote.ip,
                        port: remote.port,
                        srtp_parameters: srtp(remote.srtp_parameters)?,
                    })
                    .await
                    .map_err(request_error)
            }
            TransportHandle::Plain(transport) => {
                let remote: PlainRemote = decode("connect parameters", parameters)?;
                transport
                    .connect(ms::PlainTransportRemoteParameters {
                        ip: remote.ip,
                        port: remote.port,
                        rtcp_port: remote.rtcp_port,
                        srtp_parameters: srtp(remote.srtp_parameters)?,
                    })
                    .await
                    .map_err(request_error)
            }
        }
    }

    async fn restart_ice(&self) -> EngineResult<Value> {
        match self.handle.get("transport")? {
            TransportHandle::WebRtc(transport) => {
                let ice_parameters = transport.restart_ice().await.map_err(request_error)?;
                Ok(to_json(ice_parameters))
            }
            _ => Err(EngineError::InvalidParameters(
                "ICE restart on a non-WebRTC transport".to_string(),
            )),
        }
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> EngineResult<()> {
        let transport = self.handle.get("transport")?;
        let result = with_transport!(&transport, transport => transport.set_max_incoming_bitrate(bitrate).await);
        result.map_err(request_error)
    }

    async fn produce(&self, options: ProducerOptions) -> EngineResult<Arc<dyn engine::Producer>> {
        let transport = self.handle.get("transport")?;

        let kind = media_kind(options.kind);
        let rtp_parameters = decode("rtpParameters", options.rtp_parameters)?;
        let mut producer_options = match options.id {
            Some(id) => ms::ProducerOptions::new_pipe_transport(parse_id("producer", &id)?, kind, rtp_parameters),
            None => ms::ProducerOptions::new(kind, rtp_parameters),
        };
        producer_options.paused = options.paused;

        let producer = with_transport!(&transport, transport => transport.produce(producer_options).await)
            .map_err(request_error)?;

        let adapter = MediasoupProducer::new(producer);
        adapter.handle.follow(close_with(&self.handle, &adapter));
        Ok(adapter)
    }

    async fn consume(&self, options: ConsumerOptions) -> EngineResult<Arc<dyn engine::Consumer>> {
        let transport = self.handle.get("transport")?;

        let producer_id: ms::ProducerId = parse_id("producer", &options.producer_id)?;
        let rtp_capabilities = match options.rtp_capabilities {
            Some(capabilities) => decode("rtpCapabilities", capabilities)?,
            None => ms::RtpCapabilities::default(),
        };
        let mut consumer_options = ms::ConsumerOptions::new(producer_id, rtp_capabilities);
        consumer_options.paused = options.paused;

        let consumer = with_transport!(&transport, transport => transport.consume(consumer_options).await)
            .map_err(request_error)?;

        let adapter = MediasoupConsumer::new(consumer);
        adapter.handle.follow(close_with(&self.handle, &adapter));

        let announced: Arc<dyn engine::Consumer> = adapter.clone();
        self.new_consumer.emit(&announced);
        Ok(adapter)
    }

    async fn produce_data(&self, options: DataProducerOptions) -> EngineResult<Arc<dyn engine::DataProducer>> {
        let transport = self.handle.get("transport")?;

        let sctp_stream_parameters = options
            .sctp_stream_parameters
            .ok_or_else(|| EngineError::InvalidParameters("sctpStreamParameters are required".to_string()))?;
        let sctp_stream_parameters = decode("sctpStreamParameters", sctp_stream_parameters)?;
        let mut data_producer_options = match options.id {
            Some(id) => ms::DataProducerOptions::new_pipe_transport(
                parse_id("data producer", &id)?,
                sctp_stream_parameters,
            ),
            None => ms::DataProducerOptions::new_sctp(sctp_stream_parameters),
        };
        data_producer_options.label = options.label;
        data_producer_options.protocol = options.protocol;

        let data_producer =
            with_transport!(&transport, transport => transport.produce_data(data_producer_options).await)
                .map_err(request_error)?;

        let adapter = Arc::new(MediasoupDataProducer {
            handle: Handle::new(data_producer.id().to_string(), data_producer.clone()),
            label: data_producer.label().to_string(),
            protocol: data_producer.protocol().to_string(),
        });
        data_producer.on_close(mirror_close(&adapter)).detach();
        adapter.handle.follow(close_with(&self.handle, &adapter));
        Ok(adapter)
    }

    async fn consume_data(&self, options: DataConsumerOptions) -> EngineResult<Arc<dyn engine::DataConsumer>> {
        let transport = self.handle.get("transport")?;

        let data_producer_id: ms::DataProducerId = parse_id("data producer", &options.data_producer_id)?;
        let data_consumer_options = ms::DataConsumerOptions::new_sctp(data_producer_id);

        let data_consumer =
            with_transport!(&transport, transport => transport.consume_data(data_consumer_options).await)
                .map_err(request_error)?;

        let adapter = Arc::new(MediasoupDataConsumer {
            handle: Handle::new(data_consumer.id().to_string(), data_consumer.clone()),
            data_producer_id: options.data_producer_id,
            label: data_consumer.label().to_string(),
            protocol: data_consumer.protocol().to_string(),
            sctp_stream_parameters: data_consumer.sctp_stream_parameters().map(to_json),
        });
        data_consumer.on_close(mirror_close(&adapter)).detach();
        adapter.handle.follow(close_with(&self.handle, &adapter));
        Ok(adapter)
    }
}

pub struct MediasoupProducer {
    handle: Handle<ms::Producer>,
    kind: MediaKind,
    listeners: Arc<Listeners<ProducerEvent>>,
}

impl_resource!(MediasoupProducer);

impl MediasoupProducer {
    fn new(producer: ms::Producer) -> Arc<Self> {
        let adapter = Arc::new(Self {
            handle: Handle::new(producer.id().to_string(), producer.clone()),
            kind: from_media_kind(producer.kind()),
            listeners: Arc::new(Listeners::new()),
        });

        let listeners = Arc::downgrade(&adapter.listeners);
        producer
            .on_score(move |scores| {
                if let Some(listeners) = listeners.upgrade() {
                    listeners.emit(&ProducerEvent::Score(to_json(scores)));
                }
            })
            .detach();
        producer.on_close(mirror_close(&adapter)).detach();

        adapter
    }
}

#[async_trait]
impl engine::Producer for MediasoupProducer {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.handle.get("producer").map(|producer| producer.paused()).unwrap_or(false)
    }

    async fn pause(&self) -> EngineResult<()> {
        let producer = self.handle.get("producer")?;
        producer.pause().await.map_err(request_error)
    }

    async fn resume(&self) -> EngineResult<()> {
        let producer = self.handle.get("producer")?;
        producer.resume().await.map_err(request_error)
    }

    fn on_event(&self, callback: Arc<dyn Fn(&ProducerEvent) + Send + Sync>) -> Subscription {
        self.listeners.add(callback)
    }
}

pub struct MediasoupConsumer {
    handle: Handle<ms::Consumer>,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    listeners: Arc<Listeners<ConsumerEvent>>,
}

impl_resource!(MediasoupConsumer);

impl MediasoupConsumer {
    fn new(consumer: ms::Consumer) -> Arc<Self> {
        let adapter = Arc::new(Self {
            handle: Handle::new(consumer.id().to_string(), consumer.clone()),
            producer_id: consumer.producer_id().to_string(),
            kind: from_media_kind(consumer.kind()),
            rtp_parameters: to_json(consumer.rtp_parameters()),
            listeners: Arc::new(Listeners::new()),
        });

        let forward = |event: fn() -> ConsumerEvent| {
            let listeners = Arc::downgrade(&adapter.listeners);
            move || {
                if let Some(listeners) = listeners.upgrade() {
                    listeners.emit(&event());
                }
            }
        };
        consumer.on_producer_pause(forward(|| ConsumerEvent::ProducerPause)).detach();
        consumer.on_producer_resume(forward(|| ConsumerEvent::ProducerResume)).detach();

        let listeners = Arc::downgrade(&adapter.listeners);
        consumer
            .on_score(move |score| {
                if let Some(listeners) = listeners.upgrade() {
                    listeners.emit(&ConsumerEvent::Score(to_json(score)));
                }
            })
            .detach();

        let listeners = Arc::downgrade(&adapter.listeners);
        consumer
            .on_layers_change(move |layers| {
                let layers = layers.as_ref().map(|layers| ConsumerLayers {
                    spatial_layer: layers.spatial_layer,
                    temporal_layer: layers.temporal_layer,
                });
                if let Some(listeners) = listeners.upgrade() {
                    listeners.emit(&ConsumerEvent::LayersChange(layers));
                }
            })
            .detach();

        consumer.on_close(mirror_close(&adapter)).detach();
        adapter
    }
}

#[async_trait]
impl engine::Consumer for MediasoupConsumer {
    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.handle.get("consumer").map(|consumer| consumer.paused()).unwrap_or(false)
    }

    fn producer_paused(&self) -> bool {
        self.handle
            .get("consumer")
            .map(|consumer| consumer.producer_paused())
            .unwrap_or(false)
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    /// Emits `Pause` when the consumer itself goes from flowing to paused
    async fn pause(&self) -> EngineResult<()> {
        let consumer = self.handle.get("consumer")?;
        let was_paused = consumer.paused();
        consumer.pause().await.map_err(request_error)?;
        if !was_paused {
            self.listeners.emit(&ConsumerEvent::Pause);
        }
        Ok(())
    }

    async fn resume(&self) -> EngineResult<()> {
        let consumer = self.handle.get("consumer")?;
        let was_paused = consumer.paused();
        consumer.resume().await.map_err(request_error)?;
        if was_paused {
            self.listeners.emit(&ConsumerEvent::Resume);
        }
        Ok(())
    }

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> EngineResult<()> {
        let consumer = self.handle.get("consumer")?;
        consumer
            .set_preferred_layers(ms::ConsumerLayers {
                spatial_layer: layers.spatial_layer,
                temporal_layer: layers.temporal_layer,
            })
            .await
            .map_err(request_error)
    }

    async fn set_priority(&self, priority: u8) -> EngineResult<()> {
        if priority == 0 {
            return Err(EngineError::InvalidParameters("priority must be positive".to_string()));
        }
        let consumer = self.handle.get("consumer")?;
        consumer.set_priority(priority).await.map_err(request_error)
    }

    async fn request_key_frame(&self) -> EngineResult<()> {
        let consumer = self.handle.get("consumer")?;
        consumer.request_key_frame().await.map_err(request_error)
    }

    fn on_event(&self, callback: Arc<dyn Fn(&ConsumerEvent) + Send + Sync>) -> Subscription {
        self.listeners.add(callback)
    }
}

pub struct MediasoupDataProducer {
    handle: Handle<ms::DataProducer>,
    label: String,
    protocol: String,
}

impl_resource!(MediasoupDataProducer);

impl engine::DataProducer for MediasoupDataProducer {
    fn label(&self) -> &str {
        &self.label
    }

    fn protocol(&self) -> &str {
        &self.protocol
    }
}

pub struct MediasoupDataConsumer {
    handle: Handle<ms::DataConsumer>,
    data_producer_id: String,
    label: String,
    protocol: String,
    sctp_stream_parameters: Option<Value>,
}

impl_resource!(MediasoupDataConsumer);

impl engine::DataConsumer for MediasoupDataConsumer {
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

#[derive(Clone)]
enum ObserverHandle {
    ActiveSpeaker(ActiveSpeakerObserver),
    AudioLevel(AudioLevelObserver),
}

impl ObserverHandle {
    fn id(&self) -> String {
        match self {
            Self::ActiveSpeaker(observer) => observer.id().to_string(),
            Self::AudioLevel(observer) => observer.id().to_string(),
        }
    }

    fn on_close(&self, callback: Box<dyn FnOnce() + Send>) {
        match self {
            Self::ActiveSpeaker(observer) => observer.on_close(callback).detach(),
            Self::AudioLevel(observer) => observer.on_close(callback).detach(),
        }
    }

    fn forward_events(&self, listeners: Weak<Listeners<RtpObserverEvent>>) {
        match self {
            Self::ActiveSpeaker(observer) => observer
                .on_dominant_speaker(move |speaker| {
                    if let Some(listeners) = listeners.upgrade() {
                        listeners.emit(&RtpObserverEvent::DominantSpeaker {
                            producer_id: speaker.producer.id().to_string(),
                        });
                    }
                })
                .detach(),
            Self::AudioLevel(observer) => observer
                .on_volumes(move |volumes| {
                    let levels = volumes
                        .iter()
                        .map(|volume| AudioLevel {
                            producer_id: volume.producer.id().to_string(),
                            volume: volume.volume,
                        })
                        .collect();
                    if let Some(listeners) = listeners.upgrade() {
                        listeners.emit(&RtpObserverEvent::Volumes(levels));
                    }
                })
                .detach(),
        }
    }

    async fn add_producer(&self, producer_id: ms::ProducerId) -> EngineResult<()> {
        let options = RtpObserverAddProducerOptions::new(producer_id);
        let result = match self {
            Self::ActiveSpeaker(observer) => observer.add_producer(options).await,
            Self::AudioLevel(observer) => observer.add_producer(options).await,
        };
        result.map_err(request_error)
    }

    async fn remove_producer(&self, producer_id: ms::ProducerId) -> EngineResult<()> {
        let result = match self {
            Self::ActiveSpeaker(observer) => observer.remove_producer(producer_id).await,
            Self::AudioLevel(observer) => observer.remove_producer(producer_id).await,
        };
        result.map_err(request_error)
    }
}

pub struct MediasoupObserver {
    handle: Handle<ObserverHandle>,
    listeners: Arc<Listeners<RtpObserverEvent>>,
}

impl_resource!(MediasoupObserver);

#[async_trait]
impl engine::RtpObserver for MediasoupObserver {
    async fn add_producer(&self, producer_id: &str) -> EngineResult<()> {
        let observer = self.handle.get("rtp observer")?;
        observer.add_producer(parse_id("producer", producer_id)?).await
    }

    async fn remove_producer(&self, producer_id: &str) -> EngineResult<()> {
        let observer = self.handle.get("rtp observer")?;
        observer.remove_producer(parse_id("producer", producer_id)?).await
    }

    fn on_event(&self, callback: Arc<dyn Fn(&RtpObserverEvent) + Send + Sync>) -> Subscription {
        self.listeners.add(callback)
    }
}

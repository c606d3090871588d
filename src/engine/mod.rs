#![forbid(unsafe_code)]

// Media engine boundary - the worker processes that actually move RTP
//
// The control plane never interprets codec, ICE, DTLS or SCTP parameters; they travel
// through these traits as opaque JSON values and come back out in protocol responses.

pub mod listeners;
pub mod mediasoup;
#[cfg(test)]
pub mod memory;

pub use listeners::{Listeners, OnceListeners, Subscription};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by the media engine
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Engine request failed: {0}")]
    Request(String),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("Unknown {kind}: {id}")]
    Unknown { kind: &'static str, id: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Creates worker processes
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn EngineWorker>>;
}

/// One media-engine process
#[async_trait]
pub trait EngineWorker: Send + Sync {
    fn pid(&self) -> u32;
    fn closed(&self) -> bool;

    /// Opens the shared listening server every WebRTC transport of this worker binds to.
    async fn create_webrtc_server(&self, listen_infos: &[ListenInfo]) -> EngineResult<()>;

    /// Cumulative CPU time consumed by the worker process.
    async fn resource_usage(&self) -> EngineResult<ResourceUsage>;

    async fn create_router(&self, options: RouterOptions) -> EngineResult<Arc<dyn EngineRouter>>;

    /// Fires once when the process exits unexpectedly. The argument is the reason.
    fn on_died(&self, callback: Box<dyn FnOnce(String) + Send>) -> Subscription;

    /// Fires for every consumer created on any router of this worker.
    fn on_new_consumer(&self, callback: Arc<dyn Fn(&Arc<dyn Consumer>) + Send + Sync>) -> Subscription;

    fn close(&self);
}

/// Lifecycle shared by every resource the engine hands out
pub trait Resource: Send + Sync {
    fn id(&self) -> &str;
    fn closed(&self) -> bool;
    fn close(&self);

    /// Registers a one-shot close callback. Runs immediately if already closed.
    fn on_close(&self, callback: Box<dyn FnOnce() + Send>) -> Subscription;
}

#[async_trait]
pub trait EngineRouter: Resource {
    fn rtp_capabilities(&self) -> Value;
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(&self, options: WebRtcTransportOptions) -> EngineResult<Arc<dyn Transport>>;
    async fn create_pipe_transport(&self, options: PipeTransportOptions) -> EngineResult<Arc<dyn Transport>>;
    async fn create_plain_transport(&self, options: PlainTransportOptions) -> EngineResult<Arc<dyn Transport>>;

    async fn create_active_speaker_observer(
        &self,
        options: ActiveSpeakerObserverOptions,
    ) -> EngineResult<Arc<dyn RtpObserver>>;
    async fn create_audio_level_observer(
        &self,
        options: AudioLevelObserverOptions,
    ) -> EngineResult<Arc<dyn RtpObserver>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebRtc,
    Pipe,
    Plain,
}

#[async_trait]
pub trait Transport: Resource {
    fn kind(&self) -> TransportKind;

    /// Negotiated parameters returned to the peer on creation
    /// (`iceParameters`, `dtlsParameters`, `ip`, `port`, `srtpParameters`, ...).
    fn parameters(&self) -> Map<String, Value>;

    async fn connect(&self, parameters: Value) -> EngineResult<()>;
    async fn restart_ice(&self) -> EngineResult<Value>;
    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> EngineResult<()>;

    async fn produce(&self, options: ProducerOptions) -> EngineResult<Arc<dyn Producer>>;
    async fn consume(&self, options: ConsumerOptions) -> EngineResult<Arc<dyn Consumer>>;
    async fn produce_data(&self, options: DataProducerOptions) -> EngineResult<Arc<dyn DataProducer>>;
    async fn consume_data(&self, options: DataConsumerOptions) -> EngineResult<Arc<dyn DataConsumer>>;
}

#[async_trait]
pub trait Producer: Resource {
    fn kind(&self) -> MediaKind;
    fn paused(&self) -> bool;
    async fn pause(&self) -> EngineResult<()>;
    async fn resume(&self) -> EngineResult<()>;
    fn on_event(&self, callback: Arc<dyn Fn(&ProducerEvent) + Send + Sync>) -> Subscription;
}

#[async_trait]
pub trait Consumer: Resource {
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn paused(&self) -> bool;
    fn producer_paused(&self) -> bool;
    fn rtp_parameters(&self) -> Value;

    async fn pause(&self) -> EngineResult<()>;
    async fn resume(&self) -> EngineResult<()>;
    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> EngineResult<()>;
    async fn set_priority(&self, priority: u8) -> EngineResult<()>;
    async fn request_key_frame(&self) -> EngineResult<()>;

    fn on_event(&self, callback: Arc<dyn Fn(&ConsumerEvent) + Send + Sync>) -> Subscription;
}

pub trait DataProducer: Resource {
    fn label(&self) -> &str;
    fn protocol(&self) -> &str;
}

pub trait DataConsumer: Resource {
    fn data_producer_id(&self) -> &str;
    fn label(&self) -> &str;
    fn protocol(&self) -> &str;
    fn sctp_stream_parameters(&self) -> Option<Value>;
}

/// Active-speaker and audio-level observers share this surface
#[async_trait]
pub trait RtpObserver: Resource {
    async fn add_producer(&self, producer_id: &str) -> EngineResult<()>;
    async fn remove_producer(&self, producer_id: &str) -> EngineResult<()>;
    fn on_event(&self, callback: Arc<dyn Fn(&RtpObserverEvent) + Send + Sync>) -> Subscription;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone)]
pub enum ProducerEvent {
    Score(Value),
}

#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Pause,
    Resume,
    ProducerPause,
    ProducerResume,
    Score(Value),
    LayersChange(Option<ConsumerLayers>),
}

#[derive(Debug, Clone)]
pub enum RtpObserverEvent {
    DominantSpeaker { producer_id: String },
    Volumes(Vec<AudioLevel>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioLevel {
    pub producer_id: String,
    pub volume: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    pub spatial_layer: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal_layer: Option<u8>,
}

/// Snapshot of a worker's consumed CPU time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub user_time: Duration,
    pub system_time: Duration,
}

impl ResourceUsage {
    pub fn cpu_time(&self) -> Duration {
        self.user_time + self.system_time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

/// Address a worker listens on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenInfo {
    pub protocol: Protocol,
    pub ip: IpAddr,
    pub announced_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLogLevel {
    Debug,
    Warn,
    Error,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<String>,
    pub rtc_port_range: RangeInclusive<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouterOptions {
    pub media_codecs: Vec<RtpCodecCapability>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebRtcTransportOptions {
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub enable_sctp: bool,
    pub num_sctp_streams: Option<Value>,
    pub initial_available_outgoing_bitrate: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipeTransportOptions {
    pub listen_info: ListenInfo,
    pub enable_sctp: bool,
    pub enable_rtx: bool,
    pub enable_srtp: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlainTransportOptions {
    pub listen_info: ListenInfo,
    pub rtcp_mux: bool,
    pub comedia: bool,
    pub enable_srtp: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerOptions {
    /// Pipe producers reuse the id of the producer they mirror.
    pub id: Option<String>,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub paused: bool,
    pub app_data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerOptions {
    pub producer_id: String,
    /// Absent for pipe consumers.
    pub rtp_capabilities: Option<Value>,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataProducerOptions {
    pub id: Option<String>,
    pub sctp_stream_parameters: Option<Value>,
    pub label: String,
    pub protocol: String,
    pub app_data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataConsumerOptions {
    pub data_producer_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSpeakerObserverOptions {
    pub interval: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioLevelObserverOptions {
    pub interval: u16,
    pub max_entries: u16,
    pub threshold: i8,
}

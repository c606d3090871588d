#![forbid(unsafe_code)]

// Configuration for media workers, routers, transports and the placement scheduler

use crate::engine::{
    ListenInfo, MediaKind, PipeTransportOptions, PlainTransportOptions, Protocol, RouterOptions,
    RtpCodecCapability, WebRtcTransportOptions, WorkerLogLevel, WorkerSettings,
};
use serde_json::{json, Map, Value};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Main media server configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub webrtc_transport_config: WebRtcTransportConfig,
    pub scheduler_config: SchedulerConfig,
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub ip: Option<IpAddr>,
    pub ip6: Option<IpAddr>,
    pub announced_ip: Option<String>,
    pub announced_ip6: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                "info".to_string(),
                "ice".to_string(),
                "dtls".to_string(),
                "rtp".to_string(),
                "rtcp".to_string(),
            ],
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            ip: Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            ip6: None,
            announced_ip: None,
            announced_ip6: None,
        }
    }
}

impl WorkerConfig {
    pub fn to_worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            log_level: self.log_level,
            log_tags: self.log_tags.clone(),
            rtc_port_range: self.rtc_min_port..=self.rtc_max_port,
        }
    }

    /// Sets the announced addresses, ignoring any that equal the listen address
    pub fn with_announced(mut self, announced_ip: Option<String>, announced_ip6: Option<String>) -> Self {
        let same_as = |announced: &String, ip: Option<IpAddr>| ip.is_some_and(|ip| ip.to_string() == *announced);

        self.announced_ip = announced_ip.filter(|a| !same_as(a, self.ip));
        self.announced_ip6 = announced_ip6.filter(|a| !same_as(a, self.ip6));
        self
    }

    /// UDP and TCP listen infos for each configured address family
    pub fn webrtc_server_listen_infos(&self) -> Vec<ListenInfo> {
        let mut infos = Vec::new();
        for (ip, announced) in [(self.ip, &self.announced_ip), (self.ip6, &self.announced_ip6)] {
            let Some(ip) = ip else { continue };
            for protocol in [Protocol::Udp, Protocol::Tcp] {
                infos.push(ListenInfo {
                    protocol,
                    ip,
                    announced_address: announced.clone(),
                });
            }
        }
        infos
    }

    /// Address used by worker-to-worker and plain RTP transports
    pub fn local_listen_info(&self) -> ListenInfo {
        ListenInfo {
            protocol: Protocol::Udp,
            ip: self.ip.or(self.ip6).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            announced_address: self.announced_ip.clone(),
        }
    }

    pub fn to_pipe_transport_options(&self) -> PipeTransportOptions {
        PipeTransportOptions {
            listen_info: self.local_listen_info(),
            enable_sctp: true,
            enable_rtx: false,
            enable_srtp: false,
        }
    }

    pub fn to_plain_transport_options(&self) -> PlainTransportOptions {
        PlainTransportOptions {
            listen_info: self.local_listen_info(),
            rtcp_mux: true,
            comedia: false,
            enable_srtp: false,
        }
    }
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

fn parameters(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl RouterConfig {
    /// Returns default codec capabilities for audio and video
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: Some(2),
                parameters: Map::new(),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: None,
                parameters: parameters(json!({ "x-google-start-bitrate": 500 })),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/H264".to_string(),
                clock_rate: 90000,
                channels: None,
                parameters: parameters(json!({
                    "packetization-mode": 1,
                    "profile-level-id": "42e01f",
                    "level-asymmetry-allowed": 1,
                    "x-google-start-bitrate": 500,
                })),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP9".to_string(),
                clock_rate: 90000,
                channels: None,
                parameters: parameters(json!({ "profile-id": 0, "x-google-start-bitrate": 500 })),
            },
        ]
    }

    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions {
            media_codecs: self.media_codecs.clone(),
        }
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: Option<u32>,
    pub max_outgoing_bitrate: u32,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            initial_available_outgoing_bitrate: 600_000,
            max_incoming_bitrate: Some(10_000_000),
            max_outgoing_bitrate: 10_000_000,
        }
    }
}

impl WebRtcTransportConfig {
    /// `num_sctp_streams` is the peer's SCTP capability; its presence enables data channels.
    pub fn to_transport_options(&self, force_tcp: bool, num_sctp_streams: Option<Value>) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            enable_udp: !force_tcp,
            enable_tcp: true,
            prefer_udp: !force_tcp,
            enable_sctp: num_sctp_streams.is_some(),
            num_sctp_streams,
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
        }
    }
}

/// Placement and load-sampling knobs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    /// CPU percentage above which a room may be cascaded onto another worker
    pub cascade_limit: f64,
    /// Minimum load delta, in percentage points, that justifies cascading
    pub hysteresis: f64,
    pub load_polling_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cascade_limit: 66.0,
            hysteresis: 10.0,
            load_polling_interval: Duration::from_secs(10),
        }
    }
}

#![forbid(unsafe_code)]

// Process configuration, from command-line flags or the environment

use crate::load::AvailableBandwidth;
use crate::media::{MediaConfig, SchedulerConfig, WebRtcTransportConfig, WorkerConfig};
use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "media-node")]
#[command(about = "Media node control plane: hosts routing contexts for remote room servers")]
pub struct Config {
    /// Address the HTTP and WebSocket listener binds to
    #[arg(long, env = "LISTEN_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(long, env = "LISTEN_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Shared secret room servers must present as a bearer token
    #[arg(long, env = "SECRET")]
    pub secret: Option<String>,

    /// IPv4 address media is received on
    #[arg(long, env = "IP", default_value = "0.0.0.0")]
    pub ip: IpAddr,

    #[arg(long, env = "IP6")]
    pub ip6: Option<IpAddr>,

    /// Address advertised in ICE candidates when `ip` is not reachable from outside
    #[arg(long, env = "ANNOUNCED_IP")]
    pub announced_ip: Option<String>,

    #[arg(long, env = "ANNOUNCED_IP6")]
    pub announced_ip6: Option<String>,

    #[arg(long, env = "INITIAL_AVAILABLE_OUTGOING_BITRATE", default_value_t = 600_000)]
    pub initial_available_outgoing_bitrate: u32,

    #[arg(long, env = "MAX_INCOMING_BITRATE", default_value_t = 10_000_000)]
    pub max_incoming_bitrate: u32,

    #[arg(long, env = "MAX_OUTGOING_BITRATE", default_value_t = 10_000_000)]
    pub max_outgoing_bitrate: u32,

    #[arg(long, env = "RTC_MIN_PORT", default_value_t = 40000)]
    pub rtc_min_port: u16,

    #[arg(long, env = "RTC_MAX_PORT", default_value_t = 49999)]
    pub rtc_max_port: u16,

    /// Number of media workers, one per core by default
    #[arg(long, env = "WORKERS", default_value_t = num_cpus::get())]
    pub workers: usize,

    /// Worker CPU percentage above which rooms cascade onto another worker
    #[arg(long, env = "CASCADE_LIMIT", default_value_t = 66.0)]
    pub cascade_limit: f64,

    /// Load difference, in percentage points, needed before cascading
    #[arg(long, env = "HYSTERESIS", default_value_t = 10.0)]
    pub hysteresis: f64,

    /// Seconds between load samples
    #[arg(long, env = "LOAD_POLLING_INTERVAL", default_value_t = 10)]
    pub load_polling_interval: u64,

    /// Upload capacity in Mbit/s
    #[arg(long, env = "UPLOAD_BANDWIDTH", default_value_t = 1000.0)]
    pub upload_bandwidth: f64,

    /// Download capacity in Mbit/s
    #[arg(long, env = "DOWNLOAD_BANDWIDTH", default_value_t = 1000.0)]
    pub download_bandwidth: f64,

    /// Seconds room servers get to move away after a drain is announced
    #[arg(long, env = "DRAIN_TIMEOUT", default_value_t = 300)]
    pub drain_timeout: u64,
}

impl Config {
    pub fn load_polling_interval(&self) -> Duration {
        Duration::from_secs(self.load_polling_interval.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }

    pub fn available_bandwidth(&self) -> AvailableBandwidth {
        AvailableBandwidth {
            upload: self.upload_bandwidth,
            download: self.download_bandwidth,
        }
    }

    pub fn to_media_config(&self) -> MediaConfig {
        let worker_config = WorkerConfig {
            num_workers: self.workers.max(1),
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
            ip: Some(self.ip),
            ip6: self.ip6,
            ..WorkerConfig::default()
        }
        .with_announced(self.announced_ip.clone(), self.announced_ip6.clone());

        MediaConfig {
            worker_config,
            webrtc_transport_config: WebRtcTransportConfig {
                initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
                max_incoming_bitrate: Some(self.max_incoming_bitrate).filter(|b| *b > 0),
                max_outgoing_bitrate: self.max_outgoing_bitrate,
            },
            scheduler_config: SchedulerConfig {
                cascade_limit: self.cascade_limit,
                hysteresis: self.hysteresis,
                load_polling_interval: self.load_polling_interval(),
            },
            ..MediaConfig::default()
        }
    }
}

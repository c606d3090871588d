#![forbid(unsafe_code)]

// Admission-control load figure: worker CPU combined with interface bandwidth

use crate::media::WorkerManager;
use crate::signaling::LoadSource;
use anyhow::Result;
use serde::Serialize;
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::Networks;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Bytes per second in one Mbit/s
const BYTES_PER_MBIT: f64 = 125_000.0;

/// Link capacity the bandwidth figures are measured against, in Mbit/s
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AvailableBandwidth {
    pub upload: f64,
    pub download: f64,
}

/// Cumulative byte counters summed over every non-loopback interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

pub trait NetworkSampler: Send + Sync {
    fn counters(&self) -> Result<NetworkCounters>;
}

/// Samples interface counters through `sysinfo`
pub struct SystemNetworks {
    networks: Mutex<Networks>,
}

impl SystemNetworks {
    pub fn new() -> Self {
        Self {
            networks: Mutex::new(Networks::new_with_refreshed_list()),
        }
    }
}

impl Default for SystemNetworks {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkSampler for SystemNetworks {
    fn counters(&self) -> Result<NetworkCounters> {
        let mut networks = self.networks.lock().unwrap_or_else(|e| e.into_inner());
        networks.refresh_list();
        networks.refresh();
        if networks.iter().next().is_none() {
            anyhow::bail!("no network interfaces reported");
        }

        Ok(sum_interfaces(
            networks
                .iter()
                .map(|(name, data)| (name.as_str(), data.total_received(), data.total_transmitted())),
        ))
    }
}

fn is_loopback(name: &str) -> bool {
    name == "lo" || name.starts_with("lo0") || name.starts_with("Loopback")
}

/// Sums `(interface, received, transmitted)` totals, skipping loopback
fn sum_interfaces<'a>(interfaces: impl IntoIterator<Item = (&'a str, u64, u64)>) -> NetworkCounters {
    interfaces
        .into_iter()
        .filter(|(name, _, _)| !is_loopback(name))
        .fold(NetworkCounters::default(), |total, (_, rx, tx)| NetworkCounters {
            rx_bytes: total.rx_bytes.saturating_add(rx),
            tx_bytes: total.tx_bytes.saturating_add(tx),
        })
}

/// Served on `/load`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSnapshot {
    pub load: f64,
    pub cpu_load: f64,
    pub cpu_loads: Vec<f64>,
    pub upload_bandwidth: f64,
    pub download_bandwidth: f64,
    pub upload_bandwidth_usage: f64,
    pub download_bandwidth_usage: f64,
}

impl LoadSnapshot {
    /// `load` is the larger of the mean worker CPU and the busier link direction
    pub fn compute(cpu_loads: Vec<f64>, upload: f64, download: f64, capacity: AvailableBandwidth) -> Self {
        let cpu_load = if cpu_loads.is_empty() {
            0.0
        } else {
            cpu_loads.iter().sum::<f64>() / cpu_loads.len() as f64
        };
        let upload_bandwidth_usage = usage(upload, capacity.upload);
        let download_bandwidth_usage = usage(download, capacity.download);

        Self {
            load: cpu_load.max(upload_bandwidth_usage.max(download_bandwidth_usage)),
            cpu_load,
            cpu_loads,
            upload_bandwidth: upload,
            download_bandwidth: download,
            upload_bandwidth_usage,
            download_bandwidth_usage,
        }
    }
}

/// Percentage of `capacity`; an unknown (zero) capacity never counts as load
fn usage(mbps: f64, capacity: f64) -> f64 {
    if capacity > 0.0 {
        mbps / capacity * 100.0
    } else {
        0.0
    }
}

pub struct LoadManager {
    workers: Arc<WorkerManager>,
    sampler: Box<dyn NetworkSampler>,
    capacity: AvailableBandwidth,
    snapshot: StdRwLock<LoadSnapshot>,
    previous: Mutex<Option<(Instant, NetworkCounters)>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl LoadManager {
    pub fn new(
        workers: Arc<WorkerManager>,
        sampler: Box<dyn NetworkSampler>,
        capacity: AvailableBandwidth,
    ) -> Arc<Self> {
        Arc::new(Self {
            workers,
            sampler,
            capacity,
            snapshot: StdRwLock::new(LoadSnapshot::default()),
            previous: Mutex::new(None),
            poller: Mutex::new(None),
        })
    }

    /// Polls now and then every `period` until `stop` or the manager is dropped
    pub fn start(self: &Arc<Self>, period: Duration) {
        let manager = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                manager.poll(Instant::now());
            }
        });

        if let Some(previous) = self.poller.lock().unwrap_or_else(|e| e.into_inner()).replace(handle) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(poller) = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take() {
            poller.abort();
        }
    }

    /// Recomputes the snapshot. Bandwidth is the counter delta since the previous poll;
    /// the first poll, or a failed read, reports no traffic.
    pub fn poll(&self, now: Instant) {
        let (upload, download) = match self.sampler.counters() {
            Ok(counters) => {
                let mut previous = self.previous.lock().unwrap_or_else(|e| e.into_inner());
                let rates = match *previous {
                    Some((at, before)) => rates(before, counters, now.saturating_duration_since(at)),
                    None => (0.0, 0.0),
                };
                *previous = Some((now, counters));
                rates
            }
            Err(e) => {
                warn!("Failed to sample network counters: {:#}", e);
                (0.0, 0.0)
            }
        };

        let snapshot = LoadSnapshot::compute(self.workers.cpu_loads(), upload, download, self.capacity);
        debug!(
            "Load polled [cpuLoads: {:?}, uploadBw: {:.3}, downloadBw: {:.3}]",
            snapshot.cpu_loads, snapshot.upload_bandwidth, snapshot.download_bandwidth
        );

        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl LoadSource for LoadManager {
    fn load(&self) -> f64 {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).load
    }
}

impl Drop for LoadManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// (upload, download) in Mbit/s. Counter resets read as no traffic.
fn rates(before: NetworkCounters, after: NetworkCounters, elapsed: Duration) -> (f64, f64) {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return (0.0, 0.0);
    }
    let tx = after.tx_bytes.saturating_sub(before.tx_bytes) as f64;
    let rx = after.rx_bytes.saturating_sub(before.rx_bytes) as f64;
    (tx / secs / BYTES_PER_MBIT, rx / secs / BYTES_PER_MBIT)
}

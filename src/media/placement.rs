#![forbid(unsafe_code)]

// Worker selection for a room's router: affinity first, cascade only when it pays off

use crate::media::config::SchedulerConfig;
use std::fmt;

/// One worker as seen by the placement step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerLoad {
    pub pid: u32,
    pub cpu_usage: f64,
    /// Whether the worker already hosts a router for the room
    pub hosts_room: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementReason {
    FirstParticipant,
    BelowCascadeLimit,
    RoomWorkerLeastLoaded,
    WithinHysteresis,
    Cascade,
}

impl fmt::Display for PlacementReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::FirstParticipant => "first participant",
            Self::BelowCascadeLimit => "room worker has capacity",
            Self::RoomWorkerLeastLoaded => "room worker least loaded",
            Self::WithinHysteresis => "low delta",
            Self::Cascade => "cascade",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub pid: u32,
    pub reason: PlacementReason,
}

/// Picks the worker that should host the room's next router.
///
/// Workers are ranked by CPU usage (ties keep pool order). With no router for the room the
/// least loaded worker wins. Otherwise the least loaded room worker is kept while it is under
/// the cascade limit, while it is the least loaded worker overall, or while the gain from
/// moving is below the hysteresis band. Only past all three does the room cascade.
/// Returns `None` for an empty pool.
pub fn place(workers: &[WorkerLoad], config: &SchedulerConfig) -> Option<Placement> {
    let mut ranked: Vec<&WorkerLoad> = workers.iter().collect();
    ranked.sort_by(|a, b| a.cpu_usage.total_cmp(&b.cpu_usage));

    let least_loaded = *ranked.first()?;
    let Some(room_worker) = ranked.iter().find(|w| w.hosts_room) else {
        return Some(Placement {
            pid: least_loaded.pid,
            reason: PlacementReason::FirstParticipant,
        });
    };

    let keep = |reason| Placement {
        pid: room_worker.pid,
        reason,
    };

    if room_worker.cpu_usage < config.cascade_limit {
        return Some(keep(PlacementReason::BelowCascadeLimit));
    }
    if room_worker.pid == least_loaded.pid {
        return Some(keep(PlacementReason::RoomWorkerLeastLoaded));
    }
    if room_worker.cpu_usage - least_loaded.cpu_usage < config.hysteresis {
        return Some(keep(PlacementReason::WithinHysteresis));
    }

    Some(Placement {
        pid: least_loaded.pid,
        reason: PlacementReason::Cascade,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(pid: u32, cpu_usage: f64, hosts_room: bool) -> WorkerLoad {
        WorkerLoad {
            pid,
            cpu_usage,
            hosts_room,
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig::default()
    }

    #[test]
    fn first_participant_goes_to_least_loaded() {
        let workers = [worker(1, 40.0, false), worker(2, 5.0, false), worker(3, 20.0, false)];
        let placement = place(&workers, &config()).unwrap();
        assert_eq!(placement, Placement { pid: 2, reason: PlacementReason::FirstParticipant });
    }

    #[test]
    fn affinity_holds_below_cascade_limit() {
        let workers = [worker(1, 60.0, true), worker(2, 10.0, false)];
        let placement = place(&workers, &config()).unwrap();
        assert_eq!(placement, Placement { pid: 1, reason: PlacementReason::BelowCascadeLimit });
    }

    #[test]
    fn overloaded_room_worker_cascades() {
        let workers = [worker(1, 80.0, true), worker(2, 10.0, false)];
        let placement = place(&workers, &config()).unwrap();
        assert_eq!(placement, Placement { pid: 2, reason: PlacementReason::Cascade });
    }

    #[test]
    fn small_gain_stays_within_hysteresis() {
        let workers = [worker(1, 80.0, true), worker(2, 75.0, false)];
        let placement = place(&workers, &config()).unwrap();
        assert_eq!(placement, Placement { pid: 1, reason: PlacementReason::WithinHysteresis });
    }

    #[test]
    fn busy_room_worker_that_is_least_loaded_is_kept() {
        let workers = [worker(1, 90.0, false), worker(2, 70.0, true)];
        let placement = place(&workers, &config()).unwrap();
        assert_eq!(placement, Placement { pid: 2, reason: PlacementReason::RoomWorkerLeastLoaded });
    }

    #[test]
    fn least_loaded_room_worker_is_preferred() {
        let workers = [worker(1, 90.0, true), worker(2, 30.0, true), worker(3, 0.0, false)];
        let placement = place(&workers, &config()).unwrap();
        assert_eq!(placement.pid, 2);
    }

    #[test]
    fn ties_keep_pool_order() {
        let workers = [worker(7, 0.0, false), worker(3, 0.0, false)];
        assert_eq!(place(&workers, &config()).unwrap().pid, 7);
    }

    #[test]
    fn knobs_are_honoured() {
        let config = SchedulerConfig {
            cascade_limit: 90.0,
            hysteresis: 50.0,
            ..SchedulerConfig::default()
        };
        let workers = [worker(1, 80.0, true), worker(2, 10.0, false)];
        assert_eq!(place(&workers, &config).unwrap().reason, PlacementReason::BelowCascadeLimit);

        let workers = [worker(1, 95.0, true), worker(2, 50.0, false)];
        assert_eq!(place(&workers, &config).unwrap().reason, PlacementReason::WithinHysteresis);
    }

    #[test]
    fn empty_pool_places_nothing() {
        assert!(place(&[], &config()).is_none());
    }
}

//! Heartbeat monitor (C10) — detects stalled workers from the last time
//! their progress was observed (§4.5.10).
//!
//! Open Question 3 is decided here: the heartbeat signal is the event log
//! entry (`append_event("heartbeat", ...)`), not a file mtime — simpler to
//! keep crash-safe and consistent with every other liveness signal already
//! flowing through the state store.

use chrono::{DateTime, Utc};

use crate::state::{StateStore, StoreResult, WorkerStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleWorker {
    pub worker_id: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

pub struct HeartbeatMonitor {
    interval_seconds: u64,
    stale_threshold_seconds: u64,
}

impl HeartbeatMonitor {
    pub fn new(interval_seconds: u64, stale_threshold_seconds: u64) -> Self {
        Self {
            interval_seconds,
            stale_threshold_seconds,
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_seconds)
    }

    /// Record a heartbeat for `worker_id`: a state-store event plus the
    /// worker record's `last_heartbeat` timestamp.
    pub fn beat(&self, store: &mut StateStore, worker_id: u32, now: DateTime<Utc>) -> StoreResult<()> {
        store.append_event("heartbeat", serde_json::json!({"worker_id": worker_id}), now);
        let status = store
            .state()
            .workers
            .get(&worker_id)
            .map(|w| w.status)
            .unwrap_or(WorkerStatus::Running);
        store.set_worker_state(worker_id, status, now)
    }

    /// Workers whose last heartbeat predates `stale_threshold_seconds`, among
    /// those that are supposed to be live (`Running|Ready|Idle`).
    pub fn find_stale(&self, store: &StateStore, now: DateTime<Utc>) -> Vec<StaleWorker> {
        let threshold = chrono::Duration::seconds(self.stale_threshold_seconds as i64);
        store
            .state()
            .workers
            .values()
            .filter(|w| w.status.is_live())
            .filter_map(|w| {
                let stale = match w.last_heartbeat {
                    Some(at) => now - at >= threshold,
                    None => true,
                };
                stale.then_some(StaleWorker {
                    worker_id: w.id,
                    last_heartbeat: w.last_heartbeat,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::state::WorkerRecord;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn store_with_worker(status: WorkerStatus, last_heartbeat: Option<DateTime<Utc>>) -> StateStore {
        let mut store = StateStore::load("/tmp/nonexistent-heartbeat-test.json", "feat", now()).unwrap();
        let mut worker = WorkerRecord::new(1, "feature/worker-1", "/tmp/worker-1");
        worker.status = status;
        worker.last_heartbeat = last_heartbeat;
        store.ensure_worker(worker);
        store
    }

    #[test]
    fn fresh_heartbeat_is_not_stale() {
        let store = store_with_worker(WorkerStatus::Running, Some(now()));
        let monitor = HeartbeatMonitor::new(30, 120);
        assert!(monitor.find_stale(&store, now()).is_empty());
    }

    #[test]
    fn old_heartbeat_is_stale() {
        let store = store_with_worker(WorkerStatus::Running, Some(now() - chrono::Duration::seconds(200)));
        let monitor = HeartbeatMonitor::new(30, 120);
        let stale = monitor.find_stale(&store, now());
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].worker_id, 1);
    }

    #[test]
    fn missing_heartbeat_is_stale() {
        let store = store_with_worker(WorkerStatus::Running, None);
        let monitor = HeartbeatMonitor::new(30, 120);
        assert_eq!(monitor.find_stale(&store, now()).len(), 1);
    }

    #[test]
    fn non_live_workers_are_ignored() {
        let store = store_with_worker(WorkerStatus::Stopped, None);
        let monitor = HeartbeatMonitor::new(30, 120);
        assert!(monitor.find_stale(&store, now()).is_empty());
    }

    #[test]
    fn beat_updates_last_heartbeat_and_logs_event() {
        let mut store = store_with_worker(WorkerStatus::Running, None);
        let monitor = HeartbeatMonitor::new(30, 120);
        monitor.beat(&mut store, 1, now()).unwrap();
        assert_eq!(store.state().workers[&1].last_heartbeat, Some(now()));
        assert_eq!(store.get_events(None).last().unwrap().event, "heartbeat");
    }
}

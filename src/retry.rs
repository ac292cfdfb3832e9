//! Retry manager (C13) — task-level retry accounting with configurable
//! backoff, and the ready-for-retry promotion sweep (§4.5.7).
//!
//! The backoff math itself lives on [`crate::config::WorkersConfig`]
//! (`task_backoff_delay`); this module is the policy layer that decides,
//! from a task's current `retry_count`, whether a failure should schedule a
//! retry or become permanent, and drives the `WAITING_RETRY → PENDING`
//! promotion once a task's backoff has elapsed.

use chrono::{DateTime, Utc};

use crate::config::WorkersConfig;
use crate::state::{StateStore, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Scheduled for retry at `next_retry_at`, with `attempt` being the new count.
    ScheduleRetry { attempt: u32, next_retry_at: DateTime<Utc> },
    /// Retry budget exhausted; the task is permanently failed.
    PermanentFailure { attempt: u32 },
}

pub struct RetryManager;

impl RetryManager {
    /// Apply the retry policy to a task that just failed. Increments the
    /// retry counter; if it is still within budget, schedules `WAITING_RETRY`
    /// with a computed backoff delay, otherwise leaves the task for the
    /// caller to mark permanently `FAILED`.
    pub fn handle_task_failure(
        store: &mut StateStore,
        config: &WorkersConfig,
        task_id: &str,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<RetryDecision> {
        let attempt = store.increment_task_retry(task_id)?;
        if attempt <= config.retry_attempts {
            let delay = config.task_backoff_delay(attempt.saturating_sub(1));
            let next_retry_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            store.schedule_retry(task_id, next_retry_at)?;
            store.set_task_status(task_id, crate::state::TaskStatus::WaitingRetry, None, Some(error.into()), now)?;
            Ok(RetryDecision::ScheduleRetry { attempt, next_retry_at })
        } else {
            store.set_task_status(task_id, crate::state::TaskStatus::Failed, None, Some(error.into()), now)?;
            Ok(RetryDecision::PermanentFailure { attempt })
        }
    }

    /// Promote every `WAITING_RETRY` task whose backoff has elapsed back to
    /// `PENDING`. Returns the promoted task ids so the caller can re-dispatch
    /// them and update the level controller's bookkeeping.
    pub fn promote_ready(store: &mut StateStore, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let ready = store.get_tasks_ready_for_retry(now);
        for id in &ready {
            store.set_task_status(id, crate::state::TaskStatus::Pending, None, None, now)?;
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn config() -> WorkersConfig {
        let mut c = WorkersConfig::default();
        c.retry_attempts = 3;
        c.backoff_base_seconds = 10;
        c.backoff_max_seconds = 300;
        c
    }

    fn store() -> StateStore {
        StateStore::load("/tmp/nonexistent-retry-test.json", "feat", now()).unwrap()
    }

    #[test]
    fn schedules_retry_within_budget() {
        let mut store = store();
        store.ensure_task("A-L1-1");
        let decision =
            RetryManager::handle_task_failure(&mut store, &config(), "A-L1-1", "boom", now()).unwrap();
        assert!(matches!(decision, RetryDecision::ScheduleRetry { attempt: 1, .. }));
        assert_eq!(store.state().tasks["A-L1-1"].status, crate::state::TaskStatus::WaitingRetry);
    }

    #[test]
    fn exceeding_budget_is_permanent() {
        let mut store = store();
        store.ensure_task("A-L1-1");
        let cfg = config();
        for _ in 0..cfg.retry_attempts {
            RetryManager::handle_task_failure(&mut store, &cfg, "A-L1-1", "boom", now()).unwrap();
        }
        let decision =
            RetryManager::handle_task_failure(&mut store, &cfg, "A-L1-1", "boom", now()).unwrap();
        assert!(matches!(decision, RetryDecision::PermanentFailure { .. }));
        assert_eq!(store.state().tasks["A-L1-1"].status, crate::state::TaskStatus::Failed);
    }

    #[test]
    fn promote_ready_only_promotes_elapsed_tasks() {
        let mut store = store();
        store.ensure_task("A-L1-1");
        store.ensure_task("A-L1-2");
        store.schedule_retry("A-L1-1", now() - chrono::Duration::seconds(1)).unwrap();
        store.schedule_retry("A-L1-2", now() + chrono::Duration::seconds(100)).unwrap();

        let promoted = RetryManager::promote_ready(&mut store, now()).unwrap();
        assert_eq!(promoted, vec!["A-L1-1".to_string()]);
        assert_eq!(store.state().tasks["A-L1-1"].status, crate::state::TaskStatus::Pending);
        assert_eq!(store.state().tasks["A-L1-2"].status, crate::state::TaskStatus::WaitingRetry);
    }

    #[test]
    fn manual_retry_resets_counter() {
        let mut store = store();
        store.ensure_task("A-L1-1");
        let cfg = config();
        RetryManager::handle_task_failure(&mut store, &cfg, "A-L1-1", "boom", now()).unwrap();
        RetryManager::handle_task_failure(&mut store, &cfg, "A-L1-1", "boom", now()).unwrap();
        store.retry_task("A-L1-1").unwrap();
        assert_eq!(store.state().tasks["A-L1-1"].retry_count, 0);
        assert_eq!(store.state().tasks["A-L1-1"].status, crate::state::TaskStatus::Pending);
    }
}

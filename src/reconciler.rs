//! State reconciler (C15) — periodic and on-level-transition consistency
//! sweep between disk state and the level controller (§4.6).
//!
//! Grounded on `harness/feature_registry.rs`'s validate/cycle-detection sweep
//! pattern (one pass that both checks and repairs) and on
//! `zerg/orchestrator.py`'s `_poll_workers`/`_handle_worker_exit` crash
//! recovery logic (a worker whose container/process is gone releases its
//! in-flight task without penalizing the task's own retry budget).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::level::LevelController;
use crate::state::{StateStore, StoreResult, TaskStatus};
use crate::task_graph::level_from_id;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationFix {
    pub fix_type: String,
    pub task_id: Option<String>,
    pub worker_id: Option<u32>,
    pub from: String,
    pub to: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub fixes: Vec<ReconciliationFix>,
    pub errors: Vec<String>,
}

impl ReconciliationResult {
    pub fn is_clean(&self) -> bool {
        self.fixes.is_empty() && self.errors.is_empty()
    }
}

pub struct StateReconciler;

impl StateReconciler {
    /// Run in every poll tick: for every `IN_PROGRESS` task whose worker is
    /// gone or not live, mark it `FAILED` with `worker_crash` and reset its
    /// retry counter (a crash is not the task's fault). Backfill `level` on
    /// tasks whose id matches the recommended pattern. Sync the level
    /// controller's view of each task's outcome to match disk (disk wins).
    pub fn periodic_sweep(
        store: &mut StateStore,
        levels: &mut LevelController,
        now: DateTime<Utc>,
    ) -> StoreResult<ReconciliationResult> {
        let mut result = ReconciliationResult::default();

        let in_progress: Vec<(String, Option<u32>)> = store
            .state()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| (t.id.clone(), t.worker_id))
            .collect();

        for (task_id, worker_id) in in_progress {
            let worker_alive = worker_id
                .and_then(|id| store.state().workers.get(&id))
                .map(|w| w.status.is_live())
                .unwrap_or(false);

            if !worker_alive {
                store.set_task_status(&task_id, TaskStatus::Failed, None, Some("worker_crash".to_string()), now)?;
                store.reset_task_retry(&task_id)?;
                if let Some(level) = level_from_id(&task_id) {
                    levels.mark_task_failed(level, &task_id);
                }
                result.fixes.push(ReconciliationFix {
                    fix_type: "released_in_progress_task".to_string(),
                    task_id: Some(task_id),
                    worker_id,
                    from: "IN_PROGRESS".to_string(),
                    to: "FAILED".to_string(),
                    reason: "worker_crash".to_string(),
                });
            } else {
                // Reflect disk's status into the level controller (disk wins).
                if let Some(level) = level_from_id(&task_id) {
                    levels.mark_task_in_progress(level, &task_id);
                }
            }
        }

        // Sync terminal statuses too, so the level controller always mirrors disk.
        for task in store.state().tasks.values() {
            let Some(level) = level_from_id(&task.id) else { continue };
            match task.status {
                TaskStatus::Complete => levels.mark_task_complete(level, &task.id),
                TaskStatus::Failed => levels.mark_task_failed(level, &task.id),
                _ => {}
            }
        }

        Ok(result)
    }

    /// Run before advancing from `level` to the next one: re-run the
    /// periodic sweep, then assert every task at `level` is terminal.
    pub fn level_transition_sweep(
        store: &mut StateStore,
        levels: &mut LevelController,
        level: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<ReconciliationResult> {
        let mut result = Self::periodic_sweep(store, levels, now)?;

        let non_terminal: Vec<String> = store
            .state()
            .tasks
            .values()
            .filter(|t| level_from_id(&t.id) == Some(level) && !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();

        for task_id in non_terminal {
            result.errors.push(format!(
                "task {task_id} at level {level} is not terminal during level transition"
            ));
        }

        Ok(result)
    }
}

//! Atomic JSON-file-backed state store (C1) — one document per feature.
//!
//! Durability follows the write-temp-then-rename pattern: saving copies the
//! current file to `.backup` (best effort), writes the new document to a
//! sibling `.tmp` file, then renames it over the destination. A crash mid-save
//! leaves either the old file or the fully-written new one, never a partial
//! write. Loading tries the primary file, falls back to `.backup` if the
//! primary is corrupt, and only synthesizes a fresh document if both are
//! missing or unreadable.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{
    EventRecord, FeatureState, LevelRecord, LevelStatus, MergeStatus, TaskRecord, TaskStatus,
    WorkerRecord, WorkerStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read state file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state file at {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file at {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown task id: {0}")]
    UnknownTask(String),

    #[error("unknown worker id: {0}")]
    UnknownWorker(u32),

    #[error("unknown level: {0}")]
    UnknownLevel(u32),
}

impl crate::error::Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        false
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Single-feature state document plus its backing file path.
pub struct StateStore {
    state: FeatureState,
    path: PathBuf,
}

impl StateStore {
    fn backup_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".backup");
        PathBuf::from(p)
    }

    fn tmp_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".tmp");
        PathBuf::from(p)
    }

    fn read_document(path: &Path) -> StoreResult<FeatureState> {
        let text = std::fs::read_to_string(path).map_err(|source| StoreError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the document at `path`, synthesizing a fresh one if it is missing.
    /// An unparseable file is a hard error — it is never silently overwritten.
    pub fn load(path: impl Into<PathBuf>, feature: &str, now: DateTime<Utc>) -> StoreResult<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                state: FeatureState::new(feature, now),
                path,
            });
        }
        let state = Self::read_document(&path)?;
        Ok(Self { state, path })
    }

    /// Like [`load`], but on a corrupt primary file falls back to `.backup`
    /// before giving up. Used at orchestrator startup to survive a crash that
    /// landed mid-write despite the atomic-rename discipline (e.g. a
    /// truncated filesystem after a host crash).
    pub fn load_with_recovery(
        path: impl Into<PathBuf>,
        feature: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Self> {
        let path = path.into();
        let backup = Self::backup_path(&path);

        if !path.exists() {
            return Self::load(path, feature, now);
        }

        match Self::read_document(&path) {
            Ok(state) => Ok(Self { state, path }),
            Err(primary_err) => {
                if backup.exists() {
                    if let Ok(state) = Self::read_document(&backup) {
                        let mut store = Self { state, path };
                        let _ = store.save();
                        return Ok(store);
                    }
                }
                Err(primary_err)
            }
        }
    }

    /// Write the document atomically: backup the existing file, write a
    /// sibling temp file, then rename it over the destination.
    pub fn save(&mut self) -> StoreResult<()> {
        let backup = Self::backup_path(&self.path);
        let tmp = Self::tmp_path(&self.path);

        if self.path.exists() {
            let _ = std::fs::copy(&self.path, &backup);
        }

        let content =
            serde_json::to_string_pretty(&self.state).map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })?;
        std::fs::write(&tmp, content).map_err(|source| StoreError::WriteFile {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| StoreError::WriteFile {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    pub fn state(&self) -> &FeatureState {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn task_mut(&mut self, id: &str) -> StoreResult<&mut TaskRecord> {
        self.state
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownTask(id.to_string()))
    }

    /// Register a task record if one doesn't already exist (idempotent seed
    /// from the task graph at startup).
    pub fn ensure_task(&mut self, id: &str) {
        self.state
            .tasks
            .entry(id.to_string())
            .or_insert_with(|| TaskRecord::new(id));
    }

    pub fn set_task_status(
        &mut self,
        id: &str,
        status: TaskStatus,
        worker_id: Option<u32>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let task = self.task_mut(id)?;
        task.status = status;
        if worker_id.is_some() {
            task.worker_id = worker_id;
        }
        if error.is_some() {
            task.error = error;
        }
        match status {
            TaskStatus::InProgress => task.started_at = Some(now),
            TaskStatus::Complete => task.completed_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    /// Atomically transition a `PENDING` task to `CLAIMED` for `worker_id`.
    /// Returns `false` without mutating anything if the task is not claimable.
    pub fn claim_task(&mut self, id: &str, worker_id: u32) -> StoreResult<bool> {
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.status = TaskStatus::Claimed;
        task.worker_id = Some(worker_id);
        Ok(true)
    }

    pub fn record_task_claimed(&mut self, id: &str, worker_id: u32) -> StoreResult<()> {
        let task = self.task_mut(id)?;
        task.worker_id = Some(worker_id);
        Ok(())
    }

    pub fn record_task_started(&mut self, id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::InProgress;
        task.started_at = Some(now);
        Ok(())
    }

    pub fn record_task_completed(
        &mut self,
        id: &str,
        commit_sha: Option<String>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Complete;
        task.completed_at = Some(now);
        task.commit_sha = commit_sha;
        Ok(())
    }

    pub fn record_task_duration(&mut self, id: &str, duration_ms: u64) -> StoreResult<()> {
        let task = self.task_mut(id)?;
        task.duration_ms = Some(duration_ms);
        Ok(())
    }

    /// Increment a task's retry counter and return the new count.
    pub fn increment_task_retry(&mut self, id: &str) -> StoreResult<u32> {
        let task = self.task_mut(id)?;
        task.retry_count += 1;
        Ok(task.retry_count)
    }

    pub fn reset_task_retry(&mut self, id: &str) -> StoreResult<()> {
        let task = self.task_mut(id)?;
        task.retry_count = 0;
        task.next_retry_at = None;
        Ok(())
    }

    pub fn schedule_retry(
        &mut self,
        id: &str,
        next_retry_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::WaitingRetry;
        task.next_retry_at = Some(next_retry_at);
        Ok(())
    }

    /// Tasks whose retry delay has elapsed; promotable `WAITING_RETRY → PENDING`.
    pub fn get_tasks_ready_for_retry(&self, now: DateTime<Utc>) -> Vec<String> {
        self.state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::WaitingRetry
                    && t.next_retry_at.map(|at| at <= now).unwrap_or(true)
            })
            .map(|t| t.id.clone())
            .collect()
    }

    /// Release a task back to `PENDING`, clearing its `worker_id` and
    /// recording `error`, without touching its retry counter. Used when a
    /// worker crash, heartbeat staleness, or task timeout interrupts a task
    /// that was not itself at fault (§4.5.10).
    pub fn release_task_to_pending(&mut self, id: &str, error: Option<String>) -> StoreResult<()> {
        let task = self.task_mut(id)?;
        task.status = TaskStatus::Pending;
        task.worker_id = None;
        task.error = error;
        Ok(())
    }

    pub fn retry_task(&mut self, id: &str) -> StoreResult<()> {
        let task = self.task_mut(id)?;
        task.retry_count = 0;
        task.next_retry_at = None;
        task.status = TaskStatus::Pending;
        Ok(())
    }

    pub fn retry_all_failed(&mut self) {
        for task in self.state.tasks.values_mut() {
            if task.status == TaskStatus::Failed {
                task.retry_count = 0;
                task.next_retry_at = None;
                task.status = TaskStatus::Pending;
            }
        }
    }

    fn worker_mut(&mut self, id: u32) -> StoreResult<&mut WorkerRecord> {
        self.state
            .workers
            .get_mut(&id)
            .ok_or(StoreError::UnknownWorker(id))
    }

    pub fn ensure_worker(&mut self, record: WorkerRecord) {
        self.state.workers.entry(record.id).or_insert(record);
    }

    /// Overwrite a worker's record unconditionally — used after a (re)spawn
    /// attempt, where a prior crashed/stopped record for the same id must
    /// not linger over the fresh one.
    pub fn replace_worker(&mut self, record: WorkerRecord) {
        self.state.workers.insert(record.id, record);
    }

    pub fn set_worker_state(
        &mut self,
        id: u32,
        status: WorkerStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let worker = self.worker_mut(id)?;
        worker.status = status;
        worker.last_heartbeat = Some(now);
        Ok(())
    }

    pub fn set_worker_ready(&mut self, id: u32) -> StoreResult<()> {
        let worker = self.worker_mut(id)?;
        worker.status = WorkerStatus::Ready;
        Ok(())
    }

    pub fn get_ready_workers(&self) -> Vec<u32> {
        self.state
            .workers
            .values()
            .filter(|w| matches!(w.status, WorkerStatus::Ready | WorkerStatus::Idle))
            .map(|w| w.id)
            .collect()
    }

    fn level_mut(&mut self, level: u32) -> &mut LevelRecord {
        self.state
            .levels
            .entry(level)
            .or_insert_with(|| LevelRecord::new(level))
    }

    pub fn set_level_status(&mut self, level: u32, status: LevelStatus, now: DateTime<Utc>) {
        let record = self.level_mut(level);
        record.status = status;
        match status {
            LevelStatus::Running => record.started_at = Some(now),
            LevelStatus::Complete => record.completed_at = Some(now),
            LevelStatus::Pending => {}
        }
    }

    pub fn set_level_merge_status(
        &mut self,
        level: u32,
        status: MergeStatus,
        commit: Option<String>,
        error: Option<String>,
    ) {
        let record = self.level_mut(level);
        record.merge_status = status;
        if commit.is_some() {
            record.merge_commit = commit;
        }
        if error.is_some() {
            record.merge_error = error;
        }
    }

    pub fn append_event(&mut self, event: impl Into<String>, data: impl Serialize, now: DateTime<Utc>) {
        self.state.execution_log.push(EventRecord {
            timestamp: now,
            event: event.into(),
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        });
    }

    pub fn get_events(&self, limit: Option<usize>) -> &[EventRecord] {
        match limit {
            Some(n) if n < self.state.execution_log.len() => {
                &self.state.execution_log[self.state.execution_log.len() - n..]
            }
            _ => &self.state.execution_log,
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.state.paused = paused;
    }

    pub fn set_error(&mut self, error: Option<String>) {
        self.state.error = error;
    }

    pub fn set_current_level(&mut self, level: u32) {
        self.state.current_level = level;
    }

    /// Render a human-readable snapshot of the feature's progress.
    pub fn generate_state_md(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.state.feature));
        out.push_str(&format!("current level: {}\n", self.state.current_level));
        out.push_str(&format!("paused: {}\n\n", self.state.paused));

        out.push_str("## Tasks\n\n");
        let mut tasks: Vec<&TaskRecord> = self.state.tasks.values().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        for task in tasks {
            out.push_str(&format!("- {} — {:?}\n", task.id, task.status));
        }

        out.push_str("\n## Workers\n\n");
        let mut workers: Vec<&WorkerRecord> = self.state.workers.values().collect();
        workers.sort_by_key(|w| w.id);
        for worker in workers {
            out.push_str(&format!("- worker-{} — {:?}\n", worker.id, worker.status));
        }

        out
    }
}

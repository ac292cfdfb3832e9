//! FeatureState domain types — the mutable runtime record of one feature run.
//!
//! Distinct from [`crate::task_graph::Task`], which is the immutable input
//! describing what work exists; these types track what has actually happened
//! to that work so far.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    WaitingRetry,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Spawning,
    Ready,
    Idle,
    Running,
    Checkpointing,
    Blocked,
    Stopped,
    Crashed,
}

impl WorkerStatus {
    /// Workers in these states are considered alive for reconciliation.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            WorkerStatus::Running | WorkerStatus::Ready | WorkerStatus::Idle
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    Pending,
    Running,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    None,
    Merging,
    Complete,
    Conflict,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    pub worker_id: Option<u32>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub commit_sha: Option<String>,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            worker_id: None,
            retry_count: 0,
            next_retry_at: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error: None,
            commit_sha: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: u32,
    pub status: WorkerStatus,
    pub branch: String,
    pub worktree_path: String,
    pub port: Option<u16>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub respawn_attempts: u32,
    pub spawn_attempts: u32,
    pub container_id: Option<String>,
    pub exec_success: bool,
    pub process_verified: bool,
}

impl WorkerRecord {
    pub fn new(id: u32, branch: impl Into<String>, worktree_path: impl Into<String>) -> Self {
        Self {
            id,
            status: WorkerStatus::Spawning,
            branch: branch.into(),
            worktree_path: worktree_path.into(),
            port: None,
            last_heartbeat: None,
            respawn_attempts: 0,
            spawn_attempts: 0,
            container_id: None,
            exec_success: false,
            process_verified: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelRecord {
    pub level: u32,
    pub status: LevelStatus,
    pub merge_status: MergeStatus,
    pub merge_commit: Option<String>,
    pub merge_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl LevelRecord {
    pub fn new(level: u32) -> Self {
        Self {
            level,
            status: LevelStatus::Pending,
            merge_status: MergeStatus::None,
            merge_commit: None,
            merge_error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureState {
    pub feature: String,
    pub current_level: u32,
    pub tasks: HashMap<String, TaskRecord>,
    pub workers: HashMap<u32, WorkerRecord>,
    pub levels: HashMap<u32, LevelRecord>,
    pub execution_log: Vec<EventRecord>,
    pub paused: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl FeatureState {
    pub fn new(feature: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            feature: feature.into(),
            current_level: 0,
            tasks: HashMap::new(),
            workers: HashMap::new(),
            levels: HashMap::new(),
            execution_log: Vec::new(),
            paused: false,
            error: None,
            started_at: now,
        }
    }
}

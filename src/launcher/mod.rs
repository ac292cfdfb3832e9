//! Worker launcher (C9) — two interchangeable backends behind one trait.
//!
//! Spawning a worker is a three-stage verification: the backend creates the
//! child, confirms its entrypoint actually ran, then confirms the process is
//! still alive a moment later. Only a handle that passes all three stages is
//! tracked; a backend that fails any stage cleans up after itself and
//! reports which stage failed.

pub mod container;
pub mod subprocess;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::state::WorkerStatus;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("spawn failed for worker {worker_id}: {message}")]
    SpawnFailed { worker_id: u32, message: String },

    #[error("worker {0} not found")]
    NotFound(u32),

    #[error("terminate failed for worker {worker_id}: {message}")]
    TerminateFailed { worker_id: u32, message: String },

    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),
}

impl crate::error::Retryable for LaunchError {
    fn is_retryable(&self) -> bool {
        matches!(self, LaunchError::SpawnFailed { .. })
    }
}

pub type LaunchResult<T> = Result<T, LaunchError>;

/// Diagnostics for the three-stage spawn contract (§4.3): only when all three
/// are true does the handle enter the workers map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpawnDiagnostics {
    pub container_started: bool,
    pub exec_success: bool,
    pub process_verified: bool,
}

#[derive(Debug, Clone)]
pub struct SpawnResult {
    pub success: bool,
    pub handle: Option<WorkerHandle>,
    pub error: Option<String>,
    pub diagnostics: SpawnDiagnostics,
}

#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub worker_id: u32,
    pub pid: Option<u32>,
    pub container_id: Option<String>,
}

/// Env vars and paths a launcher needs to start one worker, per the worker
/// contract (§6): `WORKER_ID`, `FEATURE`, `BRANCH`, `WORKTREE`.
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub worker_id: u32,
    pub feature: &'a str,
    pub worktree_path: &'a Path,
    pub branch: &'a str,
    pub env: HashMap<String, String>,
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn spawn(&mut self, request: SpawnRequest<'_>) -> SpawnResult;
    async fn monitor(&mut self, worker_id: u32) -> WorkerStatus;
    async fn terminate(&mut self, worker_id: u32, force: bool) -> LaunchResult<bool>;
    async fn get_output(&self, worker_id: u32, tail_lines: usize) -> String;
    fn get_handle(&self, worker_id: u32) -> Option<&WorkerHandle>;

    async fn terminate_all(&mut self, force: bool) -> HashMap<u32, bool> {
        let ids: Vec<u32> = self.worker_ids();
        let mut results = HashMap::new();
        for id in ids {
            let ok = self.terminate(id, force).await.unwrap_or(false);
            results.insert(id, ok);
        }
        results
    }

    fn worker_ids(&self) -> Vec<u32>;
}

/// Auto-detect the backend: container if a devcontainer config exists and
/// the configured image is present locally, subprocess otherwise. An
/// explicit `mode` always wins.
pub async fn detect_backend(
    mode: crate::config::LauncherMode,
    devcontainer_path: &Path,
    container_image: &str,
) -> crate::config::LauncherMode {
    use crate::config::LauncherMode;
    match mode {
        LauncherMode::Subprocess | LauncherMode::Container => mode,
        LauncherMode::Auto => {
            if devcontainer_path.exists() && container::image_present(container_image).await {
                LauncherMode::Container
            } else {
                LauncherMode::Subprocess
            }
        }
    }
}

//! Subprocess launcher backend — spawns the worker executable as a plain
//! child process. Suitable for local runs and tests; the container backend
//! is used where per-worker filesystem/network isolation matters.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::config::LauncherConfig;
use crate::state::WorkerStatus;

use super::{LaunchError, LaunchResult, SpawnDiagnostics, SpawnRequest, SpawnResult, WorkerHandle, WorkerLauncher};

const PROCESS_VERIFY_DELAY: Duration = Duration::from_millis(200);

struct Tracked {
    handle: WorkerHandle,
    child: Child,
    status: WorkerStatus,
    log_dir: Option<PathBuf>,
}

pub struct SubprocessLauncher {
    config: LauncherConfig,
    workers: HashMap<u32, Tracked>,
}

impl SubprocessLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            workers: HashMap::new(),
        }
    }

    fn build_command(&self, request: &SpawnRequest<'_>) -> LaunchResult<Command> {
        let (program, leading_args) = self
            .config
            .worker_command
            .split_first()
            .ok_or_else(|| LaunchError::SpawnFailed {
                worker_id: request.worker_id,
                message: "no worker_command configured".to_string(),
            })?;

        let mut cmd = Command::new(program);
        cmd.args(leading_args)
            .arg("--worker-id")
            .arg(request.worker_id.to_string())
            .arg("--feature")
            .arg(request.feature)
            .arg("--worktree")
            .arg(request.worktree_path)
            .arg("--branch")
            .arg(request.branch)
            .current_dir(request.worktree_path)
            .env("WORKER_ID", request.worker_id.to_string())
            .env("FEATURE", request.feature)
            .env("BRANCH", request.branch)
            .env("WORKTREE", request.worktree_path)
            .kill_on_drop(true);

        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        Ok(cmd)
    }
}

#[async_trait]
impl WorkerLauncher for SubprocessLauncher {
    async fn spawn(&mut self, request: SpawnRequest<'_>) -> SpawnResult {
        let worker_id = request.worker_id;
        let mut diagnostics = SpawnDiagnostics::default();

        let mut cmd = match self.build_command(&request) {
            Ok(cmd) => cmd,
            Err(e) => {
                return SpawnResult {
                    success: false,
                    handle: None,
                    error: Some(e.to_string()),
                    diagnostics,
                }
            }
        };

        let mut child = match cmd
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return SpawnResult {
                    success: false,
                    handle: None,
                    error: Some(e.to_string()),
                    diagnostics,
                }
            }
        };
        diagnostics.container_started = true;

        let pid = child.id();
        if pid.is_none() {
            return SpawnResult {
                success: false,
                handle: None,
                error: Some("process exited immediately".to_string()),
                diagnostics,
            };
        }
        diagnostics.exec_success = true;

        tokio::time::sleep(PROCESS_VERIFY_DELAY).await;
        match child.try_wait() {
            Ok(None) => {
                diagnostics.process_verified = true;
            }
            _ => {
                let _ = child.kill().await;
                return SpawnResult {
                    success: false,
                    handle: None,
                    error: Some("process not running after verification delay".to_string()),
                    diagnostics,
                };
            }
        }

        let handle = WorkerHandle {
            worker_id,
            pid,
            container_id: None,
        };

        self.workers.insert(
            worker_id,
            Tracked {
                handle: handle.clone(),
                child,
                status: WorkerStatus::Running,
                log_dir: Some(self.config.log_dir.clone()),
            },
        );

        SpawnResult {
            success: true,
            handle: Some(handle),
            error: None,
            diagnostics,
        }
    }

    async fn monitor(&mut self, worker_id: u32) -> WorkerStatus {
        let Some(tracked) = self.workers.get_mut(&worker_id) else {
            return WorkerStatus::Stopped;
        };

        match tracked.child.try_wait() {
            Ok(None) => WorkerStatus::Running,
            Ok(Some(status)) => {
                let mapped = match status.code() {
                    Some(0) => WorkerStatus::Stopped,
                    Some(2) => WorkerStatus::Checkpointing,
                    Some(3) => WorkerStatus::Blocked,
                    _ => WorkerStatus::Crashed,
                };
                tracked.status = mapped;
                mapped
            }
            Err(_) => WorkerStatus::Crashed,
        }
    }

    async fn terminate(&mut self, worker_id: u32, force: bool) -> LaunchResult<bool> {
        let Some(tracked) = self.workers.get_mut(&worker_id) else {
            return Ok(false);
        };

        if force {
            tracked.child.kill().await.map_err(|e| LaunchError::TerminateFailed {
                worker_id,
                message: e.to_string(),
            })?;
        } else {
            // No portable graceful-signal API on tokio::process::Child; give
            // the worker a grace window to exit on its own, then escalate.
            let wait = tokio::time::timeout(Duration::from_secs(10), tracked.child.wait()).await;
            if wait.is_err() {
                tracked.child.kill().await.map_err(|e| LaunchError::TerminateFailed {
                    worker_id,
                    message: e.to_string(),
                })?;
            }
        }

        self.workers.remove(&worker_id);
        Ok(true)
    }

    async fn get_output(&self, worker_id: u32, tail_lines: usize) -> String {
        let Some(tracked) = self.workers.get(&worker_id) else {
            return String::new();
        };
        let Some(log_dir) = &tracked.log_dir else {
            return String::new();
        };
        let path = log_dir.join(format!("worker-{worker_id}.stdout.log"));
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => content
                .lines()
                .rev()
                .take(tail_lines)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n"),
            Err(_) => String::new(),
        }
    }

    fn get_handle(&self, worker_id: u32) -> Option<&WorkerHandle> {
        self.workers.get(&worker_id).map(|t| &t.handle)
    }

    fn worker_ids(&self) -> Vec<u32> {
        self.workers.keys().copied().collect()
    }
}

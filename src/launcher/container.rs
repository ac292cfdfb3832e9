//! Container launcher backend — spawns each worker as a container, giving it
//! an isolated filesystem and network namespace. Shells out to the `docker`
//! CLI the same way the VCS adapter shells out to `git`; no container-engine
//! client crate is in the dependency stack.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::LauncherConfig;
use crate::shell_safety::{sanitize_identifier, validate_arg};
use crate::state::WorkerStatus;

use super::{LaunchResult, SpawnDiagnostics, SpawnRequest, SpawnResult, WorkerHandle, WorkerLauncher};

/// True if `docker image inspect <image>` succeeds — used by backend
/// auto-detection.
pub async fn image_present(image: &str) -> bool {
    Command::new("docker")
        .args(["image", "inspect", image])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

struct Tracked {
    handle: WorkerHandle,
}

pub struct ContainerLauncher {
    config: LauncherConfig,
    workers: HashMap<u32, Tracked>,
}

impl ContainerLauncher {
    pub fn new(config: LauncherConfig) -> Self {
        Self {
            config,
            workers: HashMap::new(),
        }
    }

    fn container_name(&self, feature: &str, worker_id: u32) -> String {
        format!("zerg-{}-worker-{worker_id}", sanitize_identifier(feature))
    }

    async fn run_docker(&self, args: &[&str]) -> Result<String, String> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl WorkerLauncher for ContainerLauncher {
    async fn spawn(&mut self, request: SpawnRequest<'_>) -> SpawnResult {
        let worker_id = request.worker_id;
        let mut diagnostics = SpawnDiagnostics::default();

        if self.config.validate_exec {
            if let Err(e) = validate_arg(request.feature).and_then(|_| validate_arg(request.branch)) {
                return SpawnResult {
                    success: false,
                    handle: None,
                    error: Some(format!("rejected unsafe exec argument: {e}")),
                    diagnostics,
                };
            }
        }

        let name = self.container_name(request.feature, worker_id);
        let worktree = request.worktree_path.to_string_lossy().to_string();
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.clone(),
            "-v".to_string(),
            format!("{worktree}:{worktree}"),
            "-w".to_string(),
            worktree.clone(),
            "-e".to_string(),
            format!("WORKER_ID={worker_id}"),
            "-e".to_string(),
            format!("FEATURE={}", request.feature),
            "-e".to_string(),
            format!("BRANCH={}", request.branch),
            "-e".to_string(),
            format!("WORKTREE={worktree}"),
        ];
        for (key, value) in &request.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(self.config.container_image.clone());
        args.extend(self.config.worker_command.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let container_id = match self.run_docker(&arg_refs).await {
            Ok(id) => id,
            Err(message) => {
                return SpawnResult {
                    success: false,
                    handle: None,
                    error: Some(message),
                    diagnostics,
                }
            }
        };
        diagnostics.container_started = true;

        // Exec stage: confirm the entrypoint is actually alive inside.
        match self
            .run_docker(&["exec", &container_id, "true"])
            .await
        {
            Ok(_) => diagnostics.exec_success = true,
            Err(message) => {
                let _ = self.run_docker(&["rm", "-f", &container_id]).await;
                return SpawnResult {
                    success: false,
                    handle: None,
                    error: Some(message),
                    diagnostics,
                };
            }
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        match self.run_docker(&["inspect", "-f", "{{.State.Running}}", &container_id]).await {
            Ok(out) if out.trim() == "true" => diagnostics.process_verified = true,
            _ => {
                let _ = self.run_docker(&["rm", "-f", &container_id]).await;
                return SpawnResult {
                    success: false,
                    handle: None,
                    error: Some("container not running after verification delay".to_string()),
                    diagnostics,
                };
            }
        }

        let handle = WorkerHandle {
            worker_id,
            pid: None,
            container_id: Some(container_id),
        };
        self.workers.insert(worker_id, Tracked { handle: handle.clone() });

        SpawnResult {
            success: true,
            handle: Some(handle),
            error: None,
            diagnostics,
        }
    }

    async fn monitor(&mut self, worker_id: u32) -> WorkerStatus {
        let Some(tracked) = self.workers.get(&worker_id) else {
            return WorkerStatus::Stopped;
        };
        let Some(container_id) = &tracked.handle.container_id else {
            return WorkerStatus::Stopped;
        };

        match self.run_docker(&["inspect", "-f", "{{.State.Status}}", container_id]).await {
            Ok(status) => match status.trim() {
                "running" => WorkerStatus::Running,
                "paused" => WorkerStatus::Checkpointing,
                "exited" => WorkerStatus::Stopped,
                "dead" => WorkerStatus::Crashed,
                _ => WorkerStatus::Stopped,
            },
            Err(_) => WorkerStatus::Crashed,
        }
    }

    async fn terminate(&mut self, worker_id: u32, force: bool) -> LaunchResult<bool> {
        let Some(tracked) = self.workers.get(&worker_id) else {
            return Ok(false);
        };
        let Some(container_id) = tracked.handle.container_id.clone() else {
            return Ok(false);
        };

        if force {
            let _ = self.run_docker(&["kill", &container_id]).await;
        } else {
            let grace = self.config.grace_period_seconds.to_string();
            if self.run_docker(&["stop", "-t", &grace, &container_id]).await.is_err() {
                let _ = self.run_docker(&["kill", &container_id]).await;
            }
        }
        let _ = self.run_docker(&["rm", "-f", &container_id]).await;

        self.workers.remove(&worker_id);
        Ok(true)
    }

    async fn get_output(&self, worker_id: u32, tail_lines: usize) -> String {
        let Some(tracked) = self.workers.get(&worker_id) else {
            return String::new();
        };
        let Some(container_id) = &tracked.handle.container_id else {
            return String::new();
        };
        self.run_docker(&["logs", "--tail", &tail_lines.to_string(), container_id])
            .await
            .unwrap_or_default()
    }

    fn get_handle(&self, worker_id: u32) -> Option<&WorkerHandle> {
        self.workers.get(&worker_id).map(|t| &t.handle)
    }

    fn worker_ids(&self) -> Vec<u32> {
        self.workers.keys().copied().collect()
    }
}

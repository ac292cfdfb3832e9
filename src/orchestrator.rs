//! Orchestrator (C16) — the top-level driver tying every subsystem together
//! into one poll-tick loop (§5).
//!
//! Grounded on `zerg/orchestrator.py`'s `_main_loop`/`_start_level`/
//! `_spawn_worker`/`_poll_workers`/`_handle_worker_exit`: a sleep-loop in the
//! original becomes a `tokio::time::interval` tick here, and each helper
//! method below corresponds to one of that file's handler methods. Unlike the
//! Python version, task completion isn't signaled by an explicit RPC — a
//! worker is an opaque subprocess or container, so completion is inferred by
//! polling each busy worker's worktree for a HEAD commit change away from the
//! commit recorded at dispatch time, then running the task's own verification
//! command against the new commit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backpressure::BackpressureController;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::heartbeat::HeartbeatMonitor;
use crate::launcher::container::ContainerLauncher;
use crate::launcher::subprocess::SubprocessLauncher;
use crate::launcher::{detect_backend, SpawnRequest, WorkerLauncher};
use crate::level::LevelController;
use crate::merge::{MergeCoordinator, MergeFlowResult};
use crate::ports::PortAllocator;
use crate::reconciler::StateReconciler;
use crate::retry::{RetryDecision, RetryManager};
use crate::state::{LevelStatus, MergeStatus, StateStore, TaskStatus, WorkerRecord, WorkerStatus};
use crate::task_graph::{level_from_id, TaskGraph};
use crate::vcs::Vcs;
use crate::worktree::{WorktreeInfo, WorktreeManager};

/// Everything the orchestrator needs to run one feature end to end: the task
/// graph and level model, the durable state store, a worker launcher, and
/// the resilience layer (retry, circuit breaker, backpressure, heartbeat,
/// reconciler) that each subsystem composes with rather than owns.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: StateStore,
    graph: TaskGraph,
    levels: LevelController,
    launcher: Box<dyn WorkerLauncher>,
    ports: PortAllocator,
    worktrees: WorktreeManager,
    worktree_info: HashMap<u32, WorktreeInfo>,
    /// HEAD commit of a worker's worktree at the moment a task was dispatched
    /// to it; a later mismatch is how task completion is detected.
    dispatch_baseline: HashMap<String, String>,
    circuits: CircuitBreakerRegistry,
    backpressure: BackpressureController,
    heartbeat: HeartbeatMonitor,
    repo_dir: PathBuf,
    running: bool,
}

impl Orchestrator {
    /// Build an orchestrator for `feature`, loading `graph_path` and
    /// resuming any prior state found under `config.state_dir`, then
    /// provision whatever workers aren't already recorded as running.
    pub async fn bootstrap(
        config: OrchestratorConfig,
        graph_path: &Path,
        repo_dir: &Path,
    ) -> Result<Self, OrchestratorError> {
        let graph = TaskGraph::load(graph_path)?;
        let levels = LevelController::from_graph(&graph);

        std::fs::create_dir_all(&config.state_dir).ok();
        let state_path = config.state_dir.join(format!("{}.json", config.feature));
        let mut store = StateStore::load_with_recovery(&state_path, &config.feature, Utc::now())?;
        for task in graph.tasks() {
            store.ensure_task(&task.id);
        }

        let devcontainer_path = repo_dir.join(".devcontainer").join("devcontainer.json");
        let mode = detect_backend(
            config.launcher_mode,
            &devcontainer_path,
            &config.launcher.container_image,
        )
        .await;
        let launcher: Box<dyn WorkerLauncher> = match mode {
            crate::config::LauncherMode::Container => Box::new(ContainerLauncher::new(config.launcher.clone())),
            _ => Box::new(SubprocessLauncher::new(config.launcher.clone())),
        };

        let mut ports = PortAllocator::new(config.ports.range_start, config.ports.range_end);
        let worktrees = WorktreeManager::new(repo_dir, repo_dir.join(".zerg").join("worktrees"));
        let circuits = CircuitBreakerRegistry::new(
            config.circuit_breaker.failure_threshold,
            config.circuit_breaker.cooldown_seconds,
        );
        let backpressure = BackpressureController::new(
            config.resilience.enabled,
            config.backpressure.window_size,
            config.backpressure.failure_rate_threshold,
            config.backpressure.min_samples,
        );
        let heartbeat = HeartbeatMonitor::new(
            config.workers.heartbeat_interval_seconds,
            config.workers.heartbeat_stale_threshold,
        );

        let mut worktree_info = HashMap::new();
        for worker in store.state().workers.values() {
            if !worker.status.is_live() && worker.status != WorkerStatus::Spawning {
                continue;
            }
            worktree_info.insert(
                worker.id,
                WorktreeInfo {
                    worker_id: worker.id,
                    path: PathBuf::from(&worker.worktree_path),
                    branch: worker.branch.clone(),
                },
            );
            if let Some(port) = worker.port {
                ports.reserve(worker.id, port);
            }
        }

        let mut orchestrator = Self {
            config,
            store,
            graph,
            levels,
            launcher,
            ports,
            worktrees,
            worktree_info,
            dispatch_baseline: HashMap::new(),
            circuits,
            backpressure,
            heartbeat,
            repo_dir: repo_dir.to_path_buf(),
            running: false,
        };

        orchestrator.provision_workers().await?;
        orchestrator.store.save()?;
        Ok(orchestrator)
    }

    fn worker_branch(&self, worker_id: u32) -> String {
        if self.config.branch_namespace.is_empty() {
            format!("{}/worker-{worker_id}", self.config.feature)
        } else {
            format!("{}/{}/worker-{worker_id}", self.config.branch_namespace, self.config.feature)
        }
    }

    fn staging_branch(&self) -> String {
        if self.config.branch_namespace.is_empty() {
            format!("{}/staging", self.config.feature)
        } else {
            format!("{}/{}/staging", self.config.branch_namespace, self.config.feature)
        }
    }

    /// Spawn every configured worker slot that isn't already present in the
    /// state store (a fresh start), never aborting the whole run over a
    /// single worker's exhausted spawn retries (§4.5.6).
    async fn provision_workers(&mut self) -> Result<(), OrchestratorError> {
        let count = self.config.workers.count as u32;
        for worker_id in 0..count {
            if self.store.state().workers.contains_key(&worker_id) {
                continue;
            }
            if let Err(e) = self.spawn_worker_with_retry(worker_id, 0).await {
                tracing::error!(worker_id, error = %e, "worker failed to spawn after retries");
            }
        }
        Ok(())
    }

    /// Spawn (or respawn) one worker, retrying with backoff up to
    /// `workers.spawn_retry_attempts` times. `respawn_attempts` is carried
    /// through unchanged into the resulting record so the respawn budget in
    /// [`maybe_respawn`] keeps counting across attempts.
    #[tracing::instrument(name = "orchestrator.worker", skip(self), fields(feature = %self.config.feature, worker_id))]
    async fn spawn_worker_with_retry(&mut self, worker_id: u32, respawn_attempts: u32) -> Result<(), OrchestratorError> {
        let branch = self.worker_branch(worker_id);
        let port = self
            .ports
            .allocate_one(worker_id)
            .map_err(|e| OrchestratorError::recoverable(e.to_string()))?;

        let attempts = self.config.workers.spawn_retry_attempts;
        let mut last_error = None;

        for attempt in 0..=attempts {
            let now = Utc::now();
            let wt_info = match self
                .worktrees
                .create(&self.config.feature, worker_id, &branch, &self.config.target_branch)
            {
                Ok(info) => info,
                Err(e) => {
                    last_error = Some(e.to_string());
                    self.store.append_event(
                        "spawn_attempt",
                        serde_json::json!({"worker_id": worker_id, "attempt": attempt, "success": false, "error": last_error}),
                        now,
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.workers.spawn_backoff_delay(attempt)).await;
                        continue;
                    }
                    break;
                }
            };

            let request = SpawnRequest {
                worker_id,
                feature: &self.config.feature,
                worktree_path: &wt_info.path,
                branch: &branch,
                env: HashMap::new(),
            };
            let result = self.launcher.spawn(request).await;

            self.store.append_event(
                "spawn_attempt",
                serde_json::json!({
                    "worker_id": worker_id,
                    "attempt": attempt,
                    "success": result.success,
                    "exec_success": result.diagnostics.exec_success,
                    "process_verified": result.diagnostics.process_verified,
                }),
                now,
            );

            if result.success {
                self.worktree_info.insert(worker_id, wt_info.clone());
                let mut record = WorkerRecord::new(worker_id, branch.clone(), wt_info.path.to_string_lossy().to_string());
                record.port = Some(port);
                record.status = WorkerStatus::Ready;
                record.spawn_attempts = attempt + 1;
                record.respawn_attempts = respawn_attempts;
                record.exec_success = result.diagnostics.exec_success;
                record.process_verified = result.diagnostics.process_verified;
                record.container_id = result.handle.and_then(|h| h.container_id);
                record.last_heartbeat = Some(now);
                self.store.replace_worker(record);
                self.circuits.reset(worker_id);
                return Ok(());
            }

            last_error = result.error.clone();
            let _ = self.worktrees.remove(&wt_info, true);
            if attempt < attempts {
                tokio::time::sleep(self.config.workers.spawn_backoff_delay(attempt)).await;
            }
        }

        self.ports.release(worker_id);
        let mut record = WorkerRecord::new(worker_id, branch, String::new());
        record.status = WorkerStatus::Crashed;
        record.spawn_attempts = attempts + 1;
        record.respawn_attempts = respawn_attempts;
        self.store.replace_worker(record);

        Err(OrchestratorError::recoverable(format!(
            "worker {worker_id} failed to spawn after {} attempts: {}",
            attempts + 1,
            last_error.unwrap_or_default()
        )))
    }

    /// Run the orchestrator loop until a terminal state (all levels complete,
    /// or an unrecoverable error) is reached.
    pub async fn run(&mut self) -> Result<(), OrchestratorError> {
        self.running = true;
        let mut interval = tokio::time::interval(self.config.poll_interval());
        while self.running {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                self.store.set_error(Some(e.to_string()));
                let _ = self.store.save();
                return Err(e);
            }
        }
        Ok(())
    }

    #[tracing::instrument(name = "orchestrator.poll", skip(self), fields(feature = %self.config.feature))]
    async fn tick(&mut self) -> Result<(), OrchestratorError> {
        let now = Utc::now();

        let recon = StateReconciler::periodic_sweep(&mut self.store, &mut self.levels, now)?;
        for fix in &recon.fixes {
            tracing::warn!(?fix, "reconciler applied a fix");
        }

        let promoted = RetryManager::promote_ready(&mut self.store, now)?;
        for task_id in &promoted {
            if let Some(level) = level_from_id(task_id) {
                self.levels.mark_task_in_progress(level, task_id);
            }
        }

        self.poll_workers(now).await?;

        if !self.store.state().paused {
            self.dispatch_tasks(now).await?;
            self.check_in_progress_tasks(now).await?;

            let current_level = self.store.state().current_level;
            if current_level != 0 && self.levels.is_level_complete(current_level) {
                self.handle_level_complete(current_level, now).await?;
            }
        }

        self.store.save()?;
        Ok(())
    }

    fn pause(&mut self, reason: String) {
        self.store.set_paused(true);
        self.store.set_error(Some(reason));
    }

    /// Clear a pause set by a merge conflict or exhausted merge retries
    /// (§4.5.11). Callers are expected to have resolved the underlying
    /// condition out of band (rebased workers, fixed a failing gate).
    pub fn resume(&mut self) {
        self.store.set_paused(false);
        self.store.set_error(None);
    }

    /// Ensure the current (or first) level has been handed to
    /// [`LevelController::start_level`] and recorded as `RUNNING`.
    async fn ensure_level_started(&mut self, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let current = self.store.state().current_level;
        let level = if current == 0 {
            self.graph.levels().first().copied()
        } else {
            Some(current)
        };
        let Some(level) = level else { return Ok(()) };

        let already_running = self
            .store
            .state()
            .levels
            .get(&level)
            .map(|l| l.status != LevelStatus::Pending)
            .unwrap_or(false);
        if already_running {
            return Ok(());
        }

        let task_ids = self
            .levels
            .start_level(level)
            .map_err(|e| OrchestratorError::recoverable(e.to_string()))?;
        self.store.set_current_level(level);
        self.store.set_level_status(level, LevelStatus::Running, now);
        self.backpressure.register_level(level, task_ids.len());
        self.store
            .append_event("level_started", serde_json::json!({"level": level, "tasks": task_ids.len()}), now);
        Ok(())
    }

    /// Claim and dispatch `PENDING` tasks at the current level to `READY`/
    /// `IDLE` workers, skipping any a circuit breaker or backpressure gate
    /// has suppressed.
    #[tracing::instrument(name = "orchestrator.level", skip(self, now), fields(feature = %self.config.feature, level = self.store.state().current_level))]
    async fn dispatch_tasks(&mut self, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        self.ensure_level_started(now).await?;
        let level = self.store.state().current_level;
        if level == 0 || self.backpressure.is_paused(level) {
            return Ok(());
        }

        let mut pending: Vec<String> = self
            .levels
            .get_pending_tasks_for_level(level)
            .into_iter()
            .filter(|id| self.store.state().tasks.get(id).map(|t| t.status) == Some(TaskStatus::Pending))
            .collect();
        pending.sort();

        let ready_workers = self.store.get_ready_workers();
        for worker_id in ready_workers {
            if pending.is_empty() {
                break;
            }
            let task_id = pending[0].clone();
            if !self.circuits.can_accept_task(worker_id, &task_id) {
                continue;
            }
            if !self.store.claim_task(&task_id, worker_id)? {
                continue;
            }
            pending.remove(0);

            let baseline = self
                .worktree_info
                .get(&worker_id)
                .and_then(|info| Vcs::new(&info.path).head_commit().ok())
                .unwrap_or_default();
            self.dispatch_baseline.insert(task_id.clone(), baseline);

            self.store.record_task_started(&task_id, now)?;
            self.levels.mark_task_in_progress(level, &task_id);
            self.store
                .append_event("task_started", serde_json::json!({"task_id": task_id, "worker_id": worker_id}), now);
            self.write_task_assignment(worker_id, &task_id)?;
        }
        Ok(())
    }

    /// Drop the task's details into its worker's worktree as the side
    /// channel the worker contract (§6) expects; the worker program picks it
    /// up and clears or overwrites it once it starts working.
    fn write_task_assignment(&self, worker_id: u32, task_id: &str) -> Result<(), OrchestratorError> {
        let Some(task) = self.graph.get(task_id) else { return Ok(()) };
        let Some(info) = self.worktree_info.get(&worker_id) else { return Ok(()) };
        let payload = serde_json::json!({
            "task_id": task.id,
            "title": task.title,
            "description": task.description,
            "verification": {
                "command": task.verification.command,
                "timeout_seconds": task.verification.timeout_seconds,
            },
            "files": task.files,
        });
        std::fs::write(
            info.path.join(".zerg-task.json"),
            serde_json::to_string_pretty(&payload).unwrap_or_default(),
        )
        .map_err(|e| OrchestratorError::recoverable(format!("failed writing task assignment: {e}")))?;
        Ok(())
    }

    /// Poll every known worker's live status, react to crashes/stops, and
    /// sweep for heartbeat staleness.
    ///
    /// A launcher backend only ever reports *process* liveness
    /// (`Running`/`Checkpointing`/`Stopped`/`Crashed`) — neither backend's
    /// `monitor` knows or cares whether the worker is currently holding a
    /// task, so it can never report `Ready`/`Idle` itself. Dispatch keys off
    /// `Ready|Idle` (`get_ready_workers`), so a live process must be reported
    /// as `Running` only while it actually holds an in-progress task, and as
    /// `Ready`/`Idle` otherwise — never clobbered to `Running` purely because
    /// the process is alive.
    async fn poll_workers(&mut self, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let worker_ids: Vec<u32> = self.store.state().workers.keys().copied().collect();
        for worker_id in worker_ids {
            let process_status = self.launcher.monitor(worker_id).await;
            let previous = self.store.state().workers.get(&worker_id).map(|w| w.status);

            match process_status {
                WorkerStatus::Crashed if previous != Some(WorkerStatus::Crashed) => {
                    self.store.set_worker_state(worker_id, WorkerStatus::Crashed, now)?;
                    self.on_worker_crash(worker_id, now).await?;
                }
                WorkerStatus::Stopped if previous != Some(WorkerStatus::Stopped) => {
                    self.store.set_worker_state(worker_id, WorkerStatus::Stopped, now)?;
                    self.on_worker_stopped(worker_id, now).await?;
                }
                WorkerStatus::Crashed | WorkerStatus::Stopped => {}
                WorkerStatus::Running | WorkerStatus::Ready | WorkerStatus::Idle => {
                    let busy = self.task_in_progress_for(worker_id).is_some();
                    let reported = match (busy, previous) {
                        (true, _) => WorkerStatus::Running,
                        (false, Some(WorkerStatus::Idle)) => WorkerStatus::Idle,
                        (false, _) => WorkerStatus::Ready,
                    };
                    self.store.set_worker_state(worker_id, reported, now)?;
                    self.heartbeat.beat(&mut self.store, worker_id, now)?;
                }
                other => {
                    self.store.set_worker_state(worker_id, other, now)?;
                }
            }
        }

        let stale: Vec<u32> = self
            .heartbeat
            .find_stale(&self.store, now)
            .into_iter()
            .map(|s| s.worker_id)
            .collect();
        for worker_id in stale {
            self.on_worker_crash(worker_id, now).await?;
        }

        Ok(())
    }

    fn task_in_progress_for(&self, worker_id: u32) -> Option<String> {
        self.store
            .state()
            .tasks
            .values()
            .find(|t| t.worker_id == Some(worker_id) && t.status == TaskStatus::InProgress)
            .map(|t| t.id.clone())
    }

    async fn on_worker_crash(&mut self, worker_id: u32, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        self.store
            .append_event("worker_crash", serde_json::json!({"worker_id": worker_id}), now);

        if let Some(task_id) = self.task_in_progress_for(worker_id) {
            self.store.release_task_to_pending(&task_id, Some("worker_crash".to_string()))?;
            if let Some(level) = level_from_id(&task_id) {
                self.levels.mark_task_in_progress(level, &task_id);
            }
            self.dispatch_baseline.remove(&task_id);
        }
        self.circuits.reset(worker_id);

        self.maybe_respawn(worker_id, now).await?;
        Ok(())
    }

    async fn on_worker_stopped(&mut self, worker_id: u32, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        self.store
            .append_event("worker_stopped", serde_json::json!({"worker_id": worker_id}), now);

        if let Some(task_id) = self.task_in_progress_for(worker_id) {
            self.store.release_task_to_pending(&task_id, Some("worker_stopped".to_string()))?;
            if let Some(level) = level_from_id(&task_id) {
                self.levels.mark_task_in_progress(level, &task_id);
            }
            self.dispatch_baseline.remove(&task_id);
        }
        Ok(())
    }

    async fn maybe_respawn(&mut self, worker_id: u32, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        if !self.config.workers.auto_respawn {
            return Ok(());
        }
        let attempts = self
            .store
            .state()
            .workers
            .get(&worker_id)
            .map(|w| w.respawn_attempts)
            .unwrap_or(0);
        if attempts >= self.config.workers.max_respawn_attempts {
            self.store
                .append_event("respawn_exhausted", serde_json::json!({"worker_id": worker_id}), now);
            return Ok(());
        }

        if let Some(info) = self.worktree_info.remove(&worker_id) {
            let _ = self.worktrees.remove(&info, true);
        }
        self.ports.release(worker_id);

        if let Err(e) = self.spawn_worker_with_retry(worker_id, attempts + 1).await {
            tracing::error!(worker_id, error = %e, "respawn failed");
        }
        Ok(())
    }

    /// Apply the task-retry policy to a failed task, marking it permanently
    /// failed in the level controller once the retry budget is exhausted.
    fn apply_retry_policy(&mut self, task_id: &str, error: String, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let decision = RetryManager::handle_task_failure(&mut self.store, &self.config.workers, task_id, error, now)?;
        if let RetryDecision::PermanentFailure { .. } = decision {
            if let Some(level) = level_from_id(task_id) {
                self.levels.mark_task_failed(level, task_id);
            }
        }
        Ok(())
    }

    /// For every `IN_PROGRESS` task, detect completion via a HEAD change in
    /// its worker's worktree, run its verification command, and apply the
    /// retry policy on failure or timeout.
    async fn check_in_progress_tasks(&mut self, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let level = self.store.state().current_level;
        let timeout = chrono::Duration::seconds(self.config.workers.task_stale_timeout_seconds as i64);

        let in_progress: Vec<(String, Option<u32>, Option<DateTime<Utc>>)> = self
            .store
            .state()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| (t.id.clone(), t.worker_id, t.started_at))
            .collect();

        for (task_id, worker_id, started_at) in in_progress {
            let Some(worker_id) = worker_id else { continue };
            let Some(info) = self.worktree_info.get(&worker_id).cloned() else { continue };

            let head = Vcs::new(&info.path).head_commit().ok();
            let baseline = self.dispatch_baseline.get(&task_id).cloned();
            let completed = matches!((&head, &baseline), (Some(h), Some(b)) if h != b);

            if completed {
                let head = head.expect("checked above");
                if let Some(task) = self.graph.get(&task_id).cloned() {
                    let span = crate::logging::task_span(&self.config.feature, worker_id, &task_id);
                    let result = {
                        use tracing::Instrument;
                        crate::verify::verify_with_retry(&task.verification, &info.path, 1)
                            .instrument(span)
                            .await
                    };

                    if result.outcome.is_passed() {
                        self.store.record_task_completed(&task_id, Some(head.clone()), now)?;
                        self.store.record_task_duration(&task_id, result.duration_ms)?;
                        self.levels.mark_task_complete(level, &task_id);
                        self.backpressure.record_outcome(level, true);
                        self.circuits.record_success(worker_id, &task_id);
                        self.store.append_event(
                            "task_completed",
                            serde_json::json!({"task_id": task_id, "worker_id": worker_id, "commit": head}),
                            now,
                        );
                    } else {
                        self.backpressure.record_outcome(level, false);
                        self.circuits.record_failure(worker_id, &task_id);
                        self.apply_retry_policy(
                            &task_id,
                            format!("verification failed: {}", result.stderr),
                            now,
                        )?;
                    }
                }
                self.store.set_worker_ready(worker_id)?;
                self.dispatch_baseline.remove(&task_id);
                continue;
            }

            let stale = started_at.map(|s| now - s >= timeout).unwrap_or(false);
            if stale {
                self.store
                    .append_event("task_timeout", serde_json::json!({"task_id": task_id, "worker_id": worker_id}), now);
                self.backpressure.record_outcome(level, false);
                self.circuits.record_failure(worker_id, &task_id);
                self.apply_retry_policy(&task_id, "task_timeout".to_string(), now)?;
                self.store.set_worker_ready(worker_id)?;
                self.dispatch_baseline.remove(&task_id);
            }
        }
        Ok(())
    }

    /// Run the merge-retry policy around one level's [`MergeCoordinator`]
    /// flow: exponential backoff (10s/20s/40s...) on a non-conflict failure,
    /// no retry at all on a conflict — both pause the run for intervention
    /// once they can't proceed (§4.4, §4.5.11).
    #[tracing::instrument(name = "orchestrator.merge", skip(self, worker_branches, now), fields(feature = %self.config.feature, level, workers = worker_branches.len()))]
    async fn run_merge_with_policy(
        &mut self,
        level: u32,
        worker_branches: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<MergeFlowResult, OrchestratorError> {
        let repo_dir = self.repo_dir.clone();
        let coordinator = MergeCoordinator::new(&repo_dir, self.staging_branch());
        let max_retries = self.config.merge.max_retries;
        let mut attempt = 0u32;

        self.store.append_event(
            "merge_started",
            serde_json::json!({"level": level, "workers": worker_branches.len()}),
            now,
        );

        loop {
            self.store.set_level_merge_status(level, MergeStatus::Merging, None, None);
            let result = coordinator
                .full_merge_flow(level, &worker_branches, &self.config.target_branch, &self.config.quality_gates, false)
                .await;

            if result.success {
                self.store
                    .set_level_merge_status(level, MergeStatus::Complete, result.merge_commit.clone(), None);
                self.store.append_event(
                    "merge_complete",
                    serde_json::json!({"level": level, "attempt": attempt, "merge_commit": result.merge_commit}),
                    now,
                );
                return Ok(result);
            }

            if result.is_conflict {
                self.store
                    .set_level_merge_status(level, MergeStatus::Conflict, None, result.error.clone());
                let reason = result.error.clone().unwrap_or_else(|| "merge conflict".to_string());
                self.store.append_event(
                    "recoverable_error",
                    serde_json::json!({"level": level, "reason": &reason}),
                    now,
                );
                self.pause(reason.clone());
                self.store.append_event(
                    "paused_for_intervention",
                    serde_json::json!({"level": level, "reason": reason}),
                    now,
                );
                return Ok(result);
            }

            if attempt >= max_retries {
                self.store
                    .set_level_merge_status(level, MergeStatus::Failed, None, result.error.clone());
                let reason = result.error.clone().unwrap_or_else(|| "merge failed".to_string());
                self.store.append_event(
                    "recoverable_error",
                    serde_json::json!({"level": level, "reason": &reason}),
                    now,
                );
                self.pause(reason.clone());
                self.store.append_event(
                    "paused_for_intervention",
                    serde_json::json!({"level": level, "reason": reason}),
                    now,
                );
                return Ok(result);
            }

            let delay = Duration::from_secs(10u64.saturating_mul(1u64 << attempt));
            self.store.append_event(
                "merge_retry",
                serde_json::json!({"level": level, "attempt": attempt + 1, "delay_seconds": delay.as_secs(), "error": &result.error}),
                now,
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn handle_level_complete(&mut self, level: u32, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let recon = StateReconciler::level_transition_sweep(&mut self.store, &mut self.levels, level, now)?;
        for err in &recon.errors {
            tracing::warn!(level, error = %err, "non-terminal task found at level transition");
        }

        let worker_branches: Vec<String> = self
            .store
            .state()
            .workers
            .values()
            .filter(|w| w.status != WorkerStatus::Crashed)
            .map(|w| w.branch.clone())
            .collect();

        let result = self.run_merge_with_policy(level, worker_branches, now).await?;
        if !result.success {
            return Ok(());
        }

        self.store.set_level_status(level, LevelStatus::Complete, now);
        self.backpressure.resume(level);
        self.store.append_event("level_complete", serde_json::json!({"level": level}), now);

        match self.levels.advance_level(level) {
            Some(next) => self.store.set_current_level(next),
            None => {
                self.store.append_event("feature_complete", serde_json::json!({}), now);
                self.running = false;
            }
        }
        Ok(())
    }

    /// Stop the run, terminating every worker. `force` skips each launcher's
    /// grace period.
    pub async fn stop(&mut self, force: bool) -> Result<(), OrchestratorError> {
        self.running = false;
        let results = self.launcher.terminate_all(force).await;
        for (worker_id, ok) in results {
            if ok {
                self.store.set_worker_state(worker_id, WorkerStatus::Stopped, Utc::now())?;
            }
        }
        self.ports.release_all();
        self.store.save()?;
        Ok(())
    }

    pub fn state_summary(&self) -> String {
        self.store.generate_state_md()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::process::Command as StdCommand;

    use tempfile::tempdir;

    use crate::task_graph::{FileSet, TaskGraphDocument, Verification};

    fn init_repo(path: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            StdCommand::new("git").args(&args).current_dir(path).output().unwrap();
        }
        std::fs::write(path.join("README.md"), "# Test").unwrap();
        StdCommand::new("git").args(["add", "."]).current_dir(path).output().unwrap();
        StdCommand::new("git").args(["commit", "-m", "initial"]).current_dir(path).output().unwrap();
    }

    fn write_graph(path: &Path, feature: &str) {
        let doc = TaskGraphDocument {
            feature: feature.to_string(),
            version: "1".to_string(),
            generated: None,
            total_tasks: 1,
            tasks: vec![crate::task_graph::Task {
                id: "A-L1-1".to_string(),
                title: "do the thing".to_string(),
                description: String::new(),
                level: 1,
                dependencies: vec![],
                files: FileSet {
                    create: vec!["a.txt".to_string()],
                    modify: vec![],
                    read: vec![],
                },
                verification: Verification {
                    command: "true".to_string(),
                    timeout_seconds: 5,
                },
                estimate_minutes: None,
                critical_path: false,
                consumers: vec![],
                integration_test: None,
            }],
            levels: StdHashMap::new(),
            max_parallelization: None,
        };
        std::fs::write(path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    }

    fn base_config(feature: &str, state_dir: &Path) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::load(feature).unwrap();
        config.target_branch = "main".to_string();
        config.state_dir = state_dir.to_path_buf();
        config.workers.count = 0;
        config
    }

    #[tokio::test]
    async fn branch_naming_falls_back_to_feature_when_namespace_empty() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let state_dir = tempdir().unwrap();
        let graph_path = repo_dir.path().join("graph.json");
        write_graph(&graph_path, "myfeat");

        let config = base_config("myfeat", state_dir.path());
        let orchestrator = Orchestrator::bootstrap(config, &graph_path, repo_dir.path()).await.unwrap();

        assert_eq!(orchestrator.worker_branch(0), "myfeat/worker-0");
        assert_eq!(orchestrator.staging_branch(), "myfeat/staging");
    }

    #[tokio::test]
    async fn branch_naming_uses_namespace_when_configured() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let state_dir = tempdir().unwrap();
        let graph_path = repo_dir.path().join("graph.json");
        write_graph(&graph_path, "myfeat");

        let mut config = base_config("myfeat", state_dir.path());
        config.branch_namespace = "zerg".to_string();
        let orchestrator = Orchestrator::bootstrap(config, &graph_path, repo_dir.path()).await.unwrap();

        assert_eq!(orchestrator.worker_branch(0), "zerg/myfeat/worker-0");
        assert_eq!(orchestrator.staging_branch(), "zerg/myfeat/staging");
    }

    #[tokio::test]
    async fn bootstrap_with_zero_workers_provisions_nothing() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let state_dir = tempdir().unwrap();
        let graph_path = repo_dir.path().join("graph.json");
        write_graph(&graph_path, "myfeat");

        let config = base_config("myfeat", state_dir.path());
        let orchestrator = Orchestrator::bootstrap(config, &graph_path, repo_dir.path()).await.unwrap();

        assert!(orchestrator.store.state().workers.is_empty());
        assert!(orchestrator.store.state().tasks.contains_key("A-L1-1"));
    }

    #[tokio::test]
    async fn spawn_worker_with_retry_exhausts_budget_and_marks_crashed() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let state_dir = tempdir().unwrap();
        let graph_path = repo_dir.path().join("graph.json");
        write_graph(&graph_path, "myfeat");

        let mut config = base_config("myfeat", state_dir.path());
        config.workers.spawn_retry_attempts = 1;
        config.workers.spawn_backoff_base_seconds = 0;
        config.launcher.worker_command = vec!["/nonexistent-zerg-worker-binary".to_string()];
        let mut orchestrator = Orchestrator::bootstrap(config, &graph_path, repo_dir.path()).await.unwrap();

        let err = orchestrator.spawn_worker_with_retry(0, 0).await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
        assert_eq!(
            orchestrator.store.state().workers[&0].status,
            WorkerStatus::Crashed
        );
    }

    /// End-to-end happy path for one worker and one task: spawn (via a
    /// `sleep` stand-in process), dispatch, simulate the worker committing
    /// its work, detect completion through the HEAD-commit diff, then merge
    /// the level into `main`.
    #[tokio::test]
    async fn single_worker_single_task_completes_and_merges() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let state_dir = tempdir().unwrap();
        let graph_path = repo_dir.path().join("graph.json");
        write_graph(&graph_path, "myfeat");

        let mut config = base_config("myfeat", state_dir.path());
        config.workers.count = 1;
        config.launcher.worker_command = vec!["sleep".to_string(), "30".to_string()];
        let mut orchestrator = Orchestrator::bootstrap(config, &graph_path, repo_dir.path()).await.unwrap();

        assert_eq!(orchestrator.store.state().workers[&0].status, WorkerStatus::Ready);

        let now = Utc::now();
        orchestrator.dispatch_tasks(now).await.unwrap();
        assert_eq!(
            orchestrator.store.state().tasks["A-L1-1"].status,
            TaskStatus::InProgress
        );

        let worktree = orchestrator.worktree_info.get(&0).unwrap().path.clone();
        assert!(worktree.join(".zerg-task.json").exists());

        std::fs::write(worktree.join("a.txt"), "done").unwrap();
        Vcs::new(&worktree).commit("complete A-L1-1").unwrap();

        orchestrator.check_in_progress_tasks(now).await.unwrap();
        assert_eq!(
            orchestrator.store.state().tasks["A-L1-1"].status,
            TaskStatus::Complete
        );
        assert!(orchestrator.levels.is_level_complete(1));

        orchestrator.handle_level_complete(1, now).await.unwrap();
        assert_eq!(
            orchestrator.store.state().levels[&1].status,
            LevelStatus::Complete
        );
        assert_eq!(
            orchestrator.store.state().levels[&1].merge_status,
            MergeStatus::Complete
        );
        assert!(repo_dir.path().join("a.txt").exists());

        orchestrator.stop(true).await.unwrap();
    }

    fn write_graph_two_levels(path: &Path, feature: &str) {
        let make = |id: &str, level: u32, deps: Vec<String>, file: &str| crate::task_graph::Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            level,
            dependencies: deps,
            files: FileSet {
                create: vec![file.to_string()],
                modify: vec![],
                read: vec![],
            },
            verification: Verification {
                command: "true".to_string(),
                timeout_seconds: 5,
            },
            estimate_minutes: None,
            critical_path: false,
            consumers: vec![],
            integration_test: None,
        };
        let doc = TaskGraphDocument {
            feature: feature.to_string(),
            version: "1".to_string(),
            generated: None,
            total_tasks: 2,
            tasks: vec![
                make("A-L1-1", 1, vec![], "a.txt"),
                make("A-L2-1", 2, vec!["A-L1-1".to_string()], "b.txt"),
            ],
            levels: StdHashMap::new(),
            max_parallelization: None,
        };
        std::fs::write(path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    }

    fn write_graph_two_tasks_one_level(path: &Path, feature: &str) {
        let make = |id: &str, file: &str| crate::task_graph::Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            level: 1,
            dependencies: vec![],
            files: FileSet {
                create: vec![file.to_string()],
                modify: vec![],
                read: vec![],
            },
            verification: Verification {
                command: "true".to_string(),
                timeout_seconds: 5,
            },
            estimate_minutes: None,
            critical_path: false,
            consumers: vec![],
            integration_test: None,
        };
        let doc = TaskGraphDocument {
            feature: feature.to_string(),
            version: "1".to_string(),
            generated: None,
            total_tasks: 2,
            tasks: vec![make("A-L1-1", "a.txt"), make("A-L1-2", "c.txt")],
            levels: StdHashMap::new(),
            max_parallelization: None,
        };
        std::fs::write(path, serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    }

    /// Two levels, one worker: the second level only dispatches once the
    /// first has merged, and both end up on the target branch.
    #[tokio::test]
    async fn multi_level_happy_path_completes_both_levels() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let state_dir = tempdir().unwrap();
        let graph_path = repo_dir.path().join("graph.json");
        write_graph_two_levels(&graph_path, "myfeat");

        let mut config = base_config("myfeat", state_dir.path());
        config.workers.count = 1;
        config.launcher.worker_command = vec!["sleep".to_string(), "30".to_string()];
        let mut orchestrator = Orchestrator::bootstrap(config, &graph_path, repo_dir.path()).await.unwrap();

        let now = Utc::now();
        orchestrator.dispatch_tasks(now).await.unwrap();
        assert_eq!(orchestrator.store.state().current_level, 1);

        let worktree = orchestrator.worktree_info.get(&0).unwrap().path.clone();
        std::fs::write(worktree.join("a.txt"), "done").unwrap();
        Vcs::new(&worktree).commit("complete A-L1-1").unwrap();
        orchestrator.check_in_progress_tasks(now).await.unwrap();
        assert_eq!(orchestrator.store.state().tasks["A-L1-1"].status, TaskStatus::Complete);

        orchestrator.handle_level_complete(1, now).await.unwrap();
        assert_eq!(orchestrator.store.state().levels[&1].status, LevelStatus::Complete);
        assert_eq!(orchestrator.store.state().current_level, 2);

        orchestrator.dispatch_tasks(now).await.unwrap();
        assert_eq!(orchestrator.store.state().tasks["A-L2-1"].status, TaskStatus::InProgress);

        std::fs::write(worktree.join("b.txt"), "done too").unwrap();
        Vcs::new(&worktree).commit("complete A-L2-1").unwrap();
        orchestrator.check_in_progress_tasks(now).await.unwrap();
        assert_eq!(orchestrator.store.state().tasks["A-L2-1"].status, TaskStatus::Complete);

        orchestrator.handle_level_complete(2, now).await.unwrap();
        assert_eq!(orchestrator.store.state().levels[&2].status, LevelStatus::Complete);
        assert!(repo_dir.path().join("a.txt").exists());
        assert!(repo_dir.path().join("b.txt").exists());

        orchestrator.stop(true).await.unwrap();
    }

    /// Both tasks' declared file sets are disjoint (so the graph itself
    /// loads cleanly), but the stand-in workers both happen to touch an
    /// undeclared shared file, producing a real `git merge` conflict.
    #[tokio::test]
    async fn merge_conflict_pauses_the_run() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let state_dir = tempdir().unwrap();
        let graph_path = repo_dir.path().join("graph.json");
        write_graph_two_tasks_one_level(&graph_path, "myfeat");

        let mut config = base_config("myfeat", state_dir.path());
        config.workers.count = 2;
        config.launcher.worker_command = vec!["sleep".to_string(), "30".to_string()];
        let mut orchestrator = Orchestrator::bootstrap(config, &graph_path, repo_dir.path()).await.unwrap();

        let now = Utc::now();
        orchestrator.dispatch_tasks(now).await.unwrap();
        assert_eq!(orchestrator.store.state().tasks["A-L1-1"].status, TaskStatus::InProgress);
        assert_eq!(orchestrator.store.state().tasks["A-L1-2"].status, TaskStatus::InProgress);

        for worker_id in [0u32, 1] {
            let worktree = orchestrator.worktree_info.get(&worker_id).unwrap().path.clone();
            std::fs::write(worktree.join("shared.txt"), format!("from worker {worker_id}")).unwrap();
            Vcs::new(&worktree).commit("touch shared file").unwrap();
        }

        orchestrator.check_in_progress_tasks(now).await.unwrap();
        assert!(orchestrator.levels.is_level_complete(1));

        orchestrator.handle_level_complete(1, now).await.unwrap();

        assert_eq!(orchestrator.store.state().levels[&1].merge_status, MergeStatus::Conflict);
        assert_ne!(orchestrator.store.state().levels[&1].status, LevelStatus::Complete);
        assert!(orchestrator.store.state().paused);

        orchestrator.stop(true).await.unwrap();
    }

    /// A worker that dies mid-task releases its task back to `PENDING`
    /// without touching the task's own retry budget — the failure is the
    /// worker's, not the task's.
    #[tokio::test]
    async fn worker_crash_releases_task_without_penalizing_retry_budget() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let state_dir = tempdir().unwrap();
        let graph_path = repo_dir.path().join("graph.json");
        write_graph(&graph_path, "myfeat");

        let mut config = base_config("myfeat", state_dir.path());
        config.workers.count = 1;
        config.workers.auto_respawn = false;
        config.launcher.worker_command =
            vec!["sh".to_string(), "-c".to_string(), "sleep 0.3; exit 1".to_string()];
        let mut orchestrator = Orchestrator::bootstrap(config, &graph_path, repo_dir.path()).await.unwrap();

        let now = Utc::now();
        orchestrator.dispatch_tasks(now).await.unwrap();
        assert_eq!(orchestrator.store.state().tasks["A-L1-1"].status, TaskStatus::InProgress);

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        orchestrator.poll_workers(Utc::now()).await.unwrap();

        assert_eq!(orchestrator.store.state().workers[&0].status, WorkerStatus::Crashed);
        let task = &orchestrator.store.state().tasks["A-L1-1"];
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.error.as_deref(), Some("worker_crash"));
    }

    /// A task whose worker never moves HEAD past the dispatch baseline is
    /// timed out independently of whether the worker process is healthy,
    /// and scheduled for retry rather than failed outright.
    #[tokio::test]
    async fn task_timeout_triggers_retry_policy() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let state_dir = tempdir().unwrap();
        let graph_path = repo_dir.path().join("graph.json");
        write_graph(&graph_path, "myfeat");

        let mut config = base_config("myfeat", state_dir.path());
        config.workers.count = 1;
        config.workers.task_stale_timeout_seconds = 60;
        config.launcher.worker_command = vec!["sleep".to_string(), "30".to_string()];
        let mut orchestrator = Orchestrator::bootstrap(config, &graph_path, repo_dir.path()).await.unwrap();

        let now = Utc::now();
        orchestrator.dispatch_tasks(now).await.unwrap();

        orchestrator.check_in_progress_tasks(now).await.unwrap();
        assert_eq!(orchestrator.store.state().tasks["A-L1-1"].status, TaskStatus::InProgress);

        let later = now + chrono::Duration::seconds(61);
        orchestrator.check_in_progress_tasks(later).await.unwrap();

        let task = &orchestrator.store.state().tasks["A-L1-1"];
        assert_eq!(task.status, TaskStatus::WaitingRetry);
        assert_eq!(task.retry_count, 1);
        assert_eq!(orchestrator.store.state().workers[&0].status, WorkerStatus::Ready);

        orchestrator.stop(true).await.unwrap();
    }

    /// A worker command that fails before the verification delay on its
    /// first attempt (simulating a transient spawn failure) and succeeds on
    /// retry still leaves the worker `READY`, with the attempt count
    /// reflecting both tries.
    #[tokio::test]
    async fn spawn_retry_succeeds_after_transient_failure() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let state_dir = tempdir().unwrap();
        let graph_path = repo_dir.path().join("graph.json");
        write_graph(&graph_path, "myfeat");
        let marker_dir = tempdir().unwrap();
        let marker_path = marker_dir.path().join("spawned-once");

        let script = "if [ -f \"$1\" ]; then exec sleep 30; else touch \"$1\"; exit 5; fi";
        let mut config = base_config("myfeat", state_dir.path());
        config.workers.spawn_retry_attempts = 1;
        config.workers.spawn_backoff_base_seconds = 0;
        config.launcher.worker_command = vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "probe".to_string(),
            marker_path.to_string_lossy().to_string(),
        ];
        let mut orchestrator = Orchestrator::bootstrap(config, &graph_path, repo_dir.path()).await.unwrap();

        orchestrator.spawn_worker_with_retry(0, 0).await.unwrap();

        assert_eq!(orchestrator.store.state().workers[&0].status, WorkerStatus::Ready);
        assert_eq!(orchestrator.store.state().workers[&0].spawn_attempts, 2);
        assert!(marker_path.exists());

        orchestrator.stop(true).await.unwrap();
    }
}

//! Merge coordinator (C14) — per-level integration into a staging branch,
//! quality-gate execution, conflict detection, and rollback (§4.4).
//!
//! Grounded on `zerg/level_coordinator.py`'s `merge_level`/`handle_level_complete`
//! (the merge-retry/backoff/conflict-pause policy paragraph in SPEC_FULL §4.4
//! quotes it nearly verbatim: 10s/20s/40s backoff, no retry on conflict) and
//! on `vcs.rs` for the underlying git operations. The orchestrator-side retry
//! policy around `full_merge_flow` is implemented by [`crate::orchestrator`];
//! this module only runs one attempt of the flow itself.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::QualityGateConfig;
use crate::gates::{GateOutcome, GateRunResult, GateRunner};
use crate::vcs::{Vcs, VcsError};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("vcs error during merge: {0}")]
    Vcs(#[from] VcsError),
}

impl crate::error::Retryable for MergeError {
    fn is_retryable(&self) -> bool {
        match self {
            MergeError::Vcs(e) => e.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeFlowResult {
    pub success: bool,
    pub level: u32,
    pub source_branches: Vec<String>,
    pub target_branch: String,
    pub merge_commit: Option<String>,
    pub gate_results: Vec<GateRunResult>,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// True only when the failure was a merge conflict — the orchestrator
    /// must not retry this, only pause for intervention.
    pub is_conflict: bool,
}

pub struct MergeCoordinator<'a> {
    /// Working directory the staging branch is checked out in — typically
    /// the main repository checkout, not a worker's worktree.
    repo_dir: &'a Path,
    staging_branch: String,
}

impl<'a> MergeCoordinator<'a> {
    pub fn new(repo_dir: &'a Path, staging_branch: impl Into<String>) -> Self {
        Self {
            repo_dir,
            staging_branch: staging_branch.into(),
        }
    }

    fn vcs(&self) -> Vcs {
        Vcs::new(self.repo_dir)
    }

    /// Create (or reset) the staging branch from `target_branch` and check
    /// it out.
    pub fn prepare_merge(&self, target_branch: &str) -> Result<(), MergeError> {
        self.vcs().create_or_reset_branch(&self.staging_branch, target_branch)?;
        Ok(())
    }

    /// Merge each worker branch into staging in order. On the first conflict,
    /// abort that merge, delete staging, and report which branch conflicted.
    fn merge_worker_branches(&self, worker_branches: &[String]) -> Result<(), (String, String)> {
        let vcs = self.vcs();
        for branch in worker_branches {
            if let Err(e) = vcs.merge(branch) {
                let _ = vcs.delete_branch(&self.staging_branch, true);
                let files = match &e {
                    VcsError::Conflict { files } => files.clone(),
                    other => other.to_string(),
                };
                return Err((branch.clone(), files));
            }
        }
        Ok(())
    }

    /// Run pre-merge quality gates in the staging worktree. `skip_tests`
    /// filters gates whose name contains "test".
    pub async fn run_pre_merge_gates(
        &self,
        gates: &[QualityGateConfig],
        skip_tests: bool,
    ) -> (bool, Vec<GateRunResult>) {
        let filtered: Vec<QualityGateConfig> = gates
            .iter()
            .filter(|g| !(skip_tests && g.name.to_lowercase().contains("test")))
            .cloned()
            .collect();
        GateRunner::run_all_gates(&filtered, self.repo_dir, true, true).await
    }

    /// Run the full merge flow for one level: prepare staging, merge each
    /// worker branch, run pre-merge gates, fast-forward into target. Returns
    /// a result describing success/failure without mutating `target_branch`
    /// unless every step succeeded.
    pub async fn full_merge_flow(
        &self,
        level: u32,
        worker_branches: &[String],
        target_branch: &str,
        gates: &[QualityGateConfig],
        skip_tests: bool,
    ) -> MergeFlowResult {
        let timestamp = chrono::Utc::now();

        if worker_branches.is_empty() {
            return MergeFlowResult {
                success: true,
                level,
                source_branches: vec![],
                target_branch: target_branch.to_string(),
                merge_commit: None,
                gate_results: vec![],
                error: None,
                timestamp,
                is_conflict: false,
            };
        }

        if let Err(e) = self.prepare_merge(target_branch) {
            return MergeFlowResult {
                success: false,
                level,
                source_branches: worker_branches.to_vec(),
                target_branch: target_branch.to_string(),
                merge_commit: None,
                gate_results: vec![],
                error: Some(e.to_string()),
                timestamp,
                is_conflict: false,
            };
        }

        if let Err((branch, files)) = self.merge_worker_branches(worker_branches) {
            return MergeFlowResult {
                success: false,
                level,
                source_branches: worker_branches.to_vec(),
                target_branch: target_branch.to_string(),
                merge_commit: None,
                gate_results: vec![],
                error: Some(format!("conflict merging {branch}: {files}")),
                timestamp,
                is_conflict: true,
            };
        }

        let (gates_passed, gate_results) = self.run_pre_merge_gates(gates, skip_tests).await;
        if !gates_passed {
            let _ = self.vcs().delete_branch(&self.staging_branch, true);
            return MergeFlowResult {
                success: false,
                level,
                source_branches: worker_branches.to_vec(),
                target_branch: target_branch.to_string(),
                merge_commit: None,
                gate_results,
                error: Some(format!(
                    "required gate(s) failed: {}",
                    gate_results
                        .iter()
                        .filter(|g| !g.outcome.is_passed())
                        .map(|g| g.gate_name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )),
                timestamp,
                is_conflict: false,
            };
        }

        let vcs = self.vcs();
        let merge_commit = match vcs.checkout(target_branch).and_then(|_| vcs.fast_forward_merge(&self.staging_branch)) {
            Ok(commit) => commit,
            Err(e) => {
                return MergeFlowResult {
                    success: false,
                    level,
                    source_branches: worker_branches.to_vec(),
                    target_branch: target_branch.to_string(),
                    merge_commit: None,
                    gate_results,
                    error: Some(e.to_string()),
                    timestamp,
                    is_conflict: false,
                }
            }
        };

        MergeFlowResult {
            success: true,
            level,
            source_branches: worker_branches.to_vec(),
            target_branch: target_branch.to_string(),
            merge_commit: Some(merge_commit),
            gate_results,
            error: None,
            timestamp,
            is_conflict: false,
        }
    }
}

/// Classify a gate outcome list by whether any *required* gate failed. Kept
/// separate from [`GateRunner::run_all_gates`]'s return so callers that
/// already have a result set (e.g. from a cached run) can reuse it.
pub fn any_required_failed(results: &[GateRunResult], gates: &[QualityGateConfig]) -> bool {
    results.iter().any(|r| {
        !r.outcome.is_passed()
            && gates.iter().any(|g| g.name == r.gate_name && g.required)
            && !matches!(r.outcome, GateOutcome::Skip)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    fn init_repo(path: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git").args(&args).current_dir(path).output().unwrap();
        }
        std::fs::write(path.join("README.md"), "# Test").unwrap();
        Command::new("git").args(["add", "."]).current_dir(path).output().unwrap();
        Command::new("git").args(["commit", "-m", "initial"]).current_dir(path).output().unwrap();
    }

    fn commit_on_branch(repo: &Path, branch: &str, file: &str, content: &str) {
        let vcs = Vcs::new(repo);
        vcs.create_or_reset_branch(branch, "main").unwrap();
        std::fs::write(repo.join(file), content).unwrap();
        vcs.commit(&format!("add {file}")).unwrap();
        vcs.checkout("main").unwrap();
    }

    #[tokio::test]
    async fn clean_merge_fast_forwards_target() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        commit_on_branch(dir.path(), "feature/worker-1", "a.txt", "a");

        let coordinator = MergeCoordinator::new(dir.path(), "feature/staging");
        let result = coordinator
            .full_merge_flow(1, &["feature/worker-1".to_string()], "main", &[], false)
            .await;

        assert!(result.success);
        assert!(result.merge_commit.is_some());
        assert!(dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn conflicting_branches_abort_without_touching_target() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let vcs = Vcs::new(dir.path());

        vcs.create_or_reset_branch("feature/worker-1", "main").unwrap();
        std::fs::write(dir.path().join("shared.txt"), "one").unwrap();
        vcs.commit("worker 1").unwrap();
        vcs.checkout("main").unwrap();

        vcs.create_or_reset_branch("feature/worker-2", "main").unwrap();
        std::fs::write(dir.path().join("shared.txt"), "two").unwrap();
        vcs.commit("worker 2").unwrap();
        vcs.checkout("main").unwrap();

        let before = vcs.head_commit().unwrap();
        let coordinator = MergeCoordinator::new(dir.path(), "feature/staging");
        let result = coordinator
            .full_merge_flow(
                1,
                &["feature/worker-1".to_string(), "feature/worker-2".to_string()],
                "main",
                &[],
                false,
            )
            .await;

        assert!(!result.success);
        assert!(result.is_conflict);
        assert_eq!(vcs.head_commit().unwrap(), before);
    }

    #[tokio::test]
    async fn no_worker_branches_is_a_trivial_success() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let coordinator = MergeCoordinator::new(dir.path(), "feature/staging");
        let result = coordinator.full_merge_flow(1, &[], "main", &[], false).await;
        assert!(result.success);
        assert!(result.merge_commit.is_none());
    }

    #[tokio::test]
    async fn failing_required_gate_blocks_merge_into_target() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        commit_on_branch(dir.path(), "feature/worker-1", "a.txt", "a");

        let gate = QualityGateConfig {
            name: "lint".to_string(),
            command: "false".to_string(),
            required: true,
            timeout_seconds: 5,
        };

        let vcs = Vcs::new(dir.path());
        let before = vcs.head_commit().unwrap();
        let coordinator = MergeCoordinator::new(dir.path(), "feature/staging");
        let result = coordinator
            .full_merge_flow(1, &["feature/worker-1".to_string()], "main", &[gate], false)
            .await;

        assert!(!result.success);
        assert!(!result.is_conflict);
        assert_eq!(vcs.head_commit().unwrap(), before);
    }
}

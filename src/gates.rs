//! Quality-gate runner (C5) — executes a level's quality gates against the
//! staging worktree during a merge attempt.
//!
//! Gates run async via `tokio::process::Command`, each wrapped in a
//! `tokio::time::timeout`. Outcome classification: exit 0 → PASS, non-zero →
//! FAIL, timeout elapsed → TIMEOUT, spawn/IO failure → ERROR.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::QualityGateConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Pass,
    Fail,
    Timeout,
    Error,
    Skip,
}

impl GateOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, GateOutcome::Pass | GateOutcome::Skip)
    }
}

impl std::fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GateOutcome::Pass => "PASS",
            GateOutcome::Fail => "FAIL",
            GateOutcome::Timeout => "TIMEOUT",
            GateOutcome::Error => "ERROR",
            GateOutcome::Skip => "SKIP",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRunResult {
    pub gate_name: String,
    pub outcome: GateOutcome,
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GateSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub error: usize,
    pub skipped: usize,
}

impl GateSummary {
    fn record(&mut self, outcome: GateOutcome) {
        self.total += 1;
        match outcome {
            GateOutcome::Pass => self.passed += 1,
            GateOutcome::Fail => self.failed += 1,
            GateOutcome::Timeout => self.timeout += 1,
            GateOutcome::Error => self.error += 1,
            GateOutcome::Skip => self.skipped += 1,
        }
    }
}

pub struct GateRunner;

impl GateRunner {
    /// Run a single gate's shell command in `cwd`, enforcing its timeout.
    pub async fn run_gate(gate: &QualityGateConfig, cwd: &Path) -> GateRunResult {
        let start = std::time::Instant::now();

        let spawn = Command::new("sh")
            .arg("-c")
            .arg(&gate.command)
            .current_dir(cwd)
            .output();

        let result = tokio::time::timeout(Duration::from_secs(gate.timeout_seconds), spawn).await;

        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Err(_) => GateRunResult {
                gate_name: gate.name.clone(),
                outcome: GateOutcome::Timeout,
                command: gate.command.clone(),
                exit_code: None,
                stdout: String::new(),
                stderr: format!("timed out after {}s", gate.timeout_seconds),
                duration_ms,
            },
            Ok(Err(spawn_err)) => GateRunResult {
                gate_name: gate.name.clone(),
                outcome: GateOutcome::Error,
                command: gate.command.clone(),
                exit_code: None,
                stdout: String::new(),
                stderr: spawn_err.to_string(),
                duration_ms,
            },
            Ok(Ok(output)) => {
                let outcome = if output.status.success() {
                    GateOutcome::Pass
                } else {
                    GateOutcome::Fail
                };
                GateRunResult {
                    gate_name: gate.name.clone(),
                    outcome,
                    command: gate.command.clone(),
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    duration_ms,
                }
            }
        }
    }

    /// Run every gate in order. `required_only` filters to required gates
    /// first; `stop_on_failure` breaks on the first failing required gate.
    /// Optional-gate failures never flip the overall pass/fail verdict.
    pub async fn run_all_gates(
        gates: &[QualityGateConfig],
        cwd: &Path,
        stop_on_failure: bool,
        required_only: bool,
    ) -> (bool, Vec<GateRunResult>) {
        let selected: Vec<&QualityGateConfig> = gates
            .iter()
            .filter(|g| !required_only || g.required)
            .collect();

        let mut results = Vec::new();
        let mut all_passed = true;

        for gate in selected {
            let result = Self::run_gate(gate, cwd).await;
            let passed = result.outcome.is_passed();
            results.push(result);

            if !passed {
                if gate.required {
                    all_passed = false;
                    if stop_on_failure {
                        break;
                    }
                }
            }
        }

        (all_passed, results)
    }

    pub fn summarize(results: &[GateRunResult]) -> GateSummary {
        let mut summary = GateSummary::default();
        for r in results {
            summary.record(r.outcome);
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(name: &str, command: &str, required: bool) -> QualityGateConfig {
        QualityGateConfig {
            name: name.to_string(),
            command: command.to_string(),
            required,
            timeout_seconds: 5,
        }
    }

    #[tokio::test]
    async fn passing_command_yields_pass() {
        let dir = tempfile::tempdir().unwrap();
        let result = GateRunner::run_gate(&gate("ok", "true", true), dir.path()).await;
        assert_eq!(result.outcome, GateOutcome::Pass);
    }

    #[tokio::test]
    async fn failing_command_yields_fail() {
        let dir = tempfile::tempdir().unwrap();
        let result = GateRunner::run_gate(&gate("bad", "false", true), dir.path()).await;
        assert_eq!(result.outcome, GateOutcome::Fail);
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = gate("slow", "sleep 5", true);
        g.timeout_seconds = 1;
        let result = GateRunner::run_gate(&g, dir.path()).await;
        assert_eq!(result.outcome, GateOutcome::Timeout);
    }

    #[tokio::test]
    async fn required_failure_stops_remaining_gates() {
        let dir = tempfile::tempdir().unwrap();
        let gates = vec![gate("fail", "false", true), gate("never", "true", true)];
        let (all_passed, results) = GateRunner::run_all_gates(&gates, dir.path(), true, false).await;
        assert!(!all_passed);
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn optional_failure_does_not_flip_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let gates = vec![gate("optional", "false", false), gate("required", "true", true)];
        let (all_passed, results) = GateRunner::run_all_gates(&gates, dir.path(), false, false).await;
        assert!(all_passed);
        assert_eq!(results.len(), 2);
    }
}

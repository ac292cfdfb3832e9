//! Verification executor (C5b) — runs a task's own verification command in
//! the worker's worktree. Distinct from the quality-gate runner (C5) in that
//! a missing command is an automatic pass, useful for tasks whose
//! correctness is purely structural (e.g. scaffolding-only tasks).

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

use crate::gates::GateOutcome;
use crate::task_graph::Verification;

#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub outcome: GateOutcome,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

const RETRY_DELAY_MS: u64 = 500;

/// Run `verification` in `cwd`. An empty command is treated as an immediate
/// pass.
pub async fn verify(verification: &Verification, cwd: &Path) -> VerifyResult {
    if verification.command.trim().is_empty() {
        return VerifyResult {
            outcome: GateOutcome::Pass,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
        };
    }

    let start = std::time::Instant::now();
    let spawn = Command::new("sh")
        .arg("-c")
        .arg(&verification.command)
        .current_dir(cwd)
        .output();

    let result = tokio::time::timeout(
        Duration::from_secs(verification.timeout_seconds),
        spawn,
    )
    .await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match result {
        Err(_) => VerifyResult {
            outcome: GateOutcome::Timeout,
            exit_code: None,
            stdout: String::new(),
            stderr: format!("timed out after {}s", verification.timeout_seconds),
            duration_ms,
        },
        Ok(Err(e)) => VerifyResult {
            outcome: GateOutcome::Error,
            exit_code: None,
            stdout: String::new(),
            stderr: e.to_string(),
            duration_ms,
        },
        Ok(Ok(output)) => VerifyResult {
            outcome: if output.status.success() {
                GateOutcome::Pass
            } else {
                GateOutcome::Fail
            },
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
        },
    }
}

/// Retry verification up to `attempts` times with a fixed small delay
/// between tries, stopping early on the first pass.
pub async fn verify_with_retry(
    verification: &Verification,
    cwd: &Path,
    attempts: u32,
) -> VerifyResult {
    let mut last = verify(verification, cwd).await;
    let mut tried = 1;
    while !last.outcome.is_passed() && tried < attempts {
        tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
        last = verify(verification, cwd).await;
        tried += 1;
    }
    last
}

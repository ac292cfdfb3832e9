//! VCS adapter (C4) — git invoked as an external command, with retry on
//! transient failures (lock contention, repo busy, network).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("git {args}: {message}")]
    Command { args: String, message: String },

    #[error("git {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },

    #[error("merge conflict in: {files}")]
    Conflict { files: String },
}

impl VcsError {
    fn command(args: &[&str], message: impl Into<String>) -> Self {
        Self::Command {
            args: args.join(" "),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            VcsError::Command { message, .. } => {
                let lower = message.to_lowercase();
                lower.contains("lock")
                    || lower.contains("timeout")
                    || lower.contains("connection")
                    || lower.contains("network")
                    || lower.contains("another git process")
            }
            VcsError::Spawn { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ),
            VcsError::Conflict { .. } => false,
        }
    }
}

impl crate::error::Retryable for VcsError {
    fn is_retryable(&self) -> bool {
        VcsError::is_retryable(self)
    }
}

pub type VcsResult<T> = Result<T, VcsError>;

/// Thin wrapper over `git` invoked in a worktree, with exponential-backoff
/// retry around commands prone to transient failure.
pub struct Vcs {
    working_dir: PathBuf,
    max_retries: u32,
}

impl Vcs {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn run(&self, args: &[&str]) -> VcsResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|source| VcsError::Spawn {
                args: args.join(" "),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(VcsError::command(args, stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_with_retry(&self, args: &[&str]) -> VcsResult<String> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            match self.run(args) {
                Ok(out) => return Ok(out),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                    std::thread::sleep(Duration::from_millis(delay));
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| VcsError::command(args, "max retries exceeded")))
    }

    pub fn current_branch(&self) -> VcsResult<String> {
        self.run(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn head_commit(&self) -> VcsResult<String> {
        self.run(&["rev-parse", "HEAD"])
    }

    pub fn has_uncommitted_changes(&self) -> VcsResult<bool> {
        Ok(!self.run(&["status", "--porcelain"])?.is_empty())
    }

    /// Create `branch` from `from_ref` if it doesn't already exist, and check
    /// it out. Used both for per-worker branches and the staging branch.
    pub fn create_or_reset_branch(&self, branch: &str, from_ref: &str) -> VcsResult<()> {
        self.run(&["checkout", from_ref])?;
        let _ = self.run(&["branch", "-D", branch]); // best effort, may not exist
        self.run_with_retry(&["checkout", "-b", branch, from_ref])?;
        Ok(())
    }

    pub fn checkout(&self, branch: &str) -> VcsResult<()> {
        self.run_with_retry(&["checkout", branch])?;
        Ok(())
    }

    pub fn delete_branch(&self, branch: &str, force: bool) -> VcsResult<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run_with_retry(&["branch", flag, branch])?;
        Ok(())
    }

    /// Merge `source` into the currently checked-out branch. On conflict,
    /// aborts the in-progress merge and returns `VcsError::Conflict` naming
    /// the conflicted files.
    pub fn merge(&self, source: &str) -> VcsResult<()> {
        match self.run(&["merge", "--no-edit", source]) {
            Ok(_) => Ok(()),
            Err(_) => {
                let conflicted = self
                    .run(&["diff", "--name-only", "--diff-filter=U"])
                    .unwrap_or_default();
                let _ = self.run(&["merge", "--abort"]);
                Err(VcsError::Conflict {
                    files: if conflicted.is_empty() {
                        "unknown".to_string()
                    } else {
                        conflicted.replace('\n', ", ")
                    },
                })
            }
        }
    }

    pub fn fast_forward_merge(&self, source: &str) -> VcsResult<String> {
        self.run_with_retry(&["merge", "--ff-only", source])?;
        self.head_commit()
    }

    pub fn commit(&self, message: &str) -> VcsResult<String> {
        self.run_with_retry(&["add", "-A"])?;
        if !self.has_uncommitted_changes()? {
            return Err(VcsError::command(&["commit"], "nothing to commit"));
        }
        self.run_with_retry(&["commit", "-m", message])?;
        self.head_commit()
    }

    pub fn stash(&self, message: &str) -> VcsResult<()> {
        self.run_with_retry(&["stash", "push", "-m", message])?;
        Ok(())
    }

    pub fn stash_pop(&self) -> VcsResult<()> {
        self.run_with_retry(&["stash", "pop"])?;
        Ok(())
    }

    pub fn rebase(&self, onto: &str) -> VcsResult<()> {
        match self.run(&["rebase", onto]) {
            Ok(_) => Ok(()),
            Err(e) => {
                let _ = self.run(&["rebase", "--abort"]);
                Err(e)
            }
        }
    }
}

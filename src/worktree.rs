//! Worktree manager (C3) — one `git worktree` per worker, partitioned so
//! workers never share a filesystem view.

use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("git worktree {args}: {message}")]
    Command { args: String, message: String },

    #[error("git worktree {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },
}

impl crate::error::Retryable for WorktreeError {
    fn is_retryable(&self) -> bool {
        false
    }
}

pub type WorktreeResult<T> = Result<T, WorktreeError>;

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub worker_id: u32,
    pub path: PathBuf,
    pub branch: String,
}

/// Creates and tears down `git worktree`s rooted under a configured base
/// directory, one per worker, on a dedicated per-worker branch.
pub struct WorktreeManager {
    repo_path: PathBuf,
    base_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_path: impl AsRef<Path>, base_dir: impl AsRef<Path>) -> Self {
        Self {
            repo_path: repo_path.as_ref().to_path_buf(),
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn run(&self, args: &[&str]) -> WorktreeResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .output()
            .map_err(|source| WorktreeError::Spawn {
                args: args.join(" "),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(WorktreeError::Command {
                args: args.join(" "),
                message: stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn worktree_path(&self, feature: &str, worker_id: u32) -> PathBuf {
        self.base_dir.join(feature).join(format!("worker-{worker_id}"))
    }

    /// Create a worktree for `worker_id` checked out on `branch` (created
    /// fresh from `from_ref` if it doesn't exist).
    pub fn create(
        &self,
        feature: &str,
        worker_id: u32,
        branch: &str,
        from_ref: &str,
    ) -> WorktreeResult<WorktreeInfo> {
        let path = self.worktree_path(feature, worker_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WorktreeError::Spawn {
                args: "mkdir".to_string(),
                source,
            })?;
        }

        let path_str = path.to_string_lossy().to_string();
        self.run(&["worktree", "add", "-b", branch, &path_str, from_ref])?;

        Ok(WorktreeInfo {
            worker_id,
            path,
            branch: branch.to_string(),
        })
    }

    pub fn remove(&self, info: &WorktreeInfo, force: bool) -> WorktreeResult<()> {
        let path_str = info.path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.run(&args)?;
        Ok(())
    }

    pub fn list(&self) -> WorktreeResult<String> {
        self.run(&["worktree", "list", "--porcelain"])
    }

    pub fn prune(&self) -> WorktreeResult<()> {
        self.run(&["worktree", "prune"])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn init_repo(path: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
        ] {
            Command::new("git").args(&args).current_dir(path).output().unwrap();
        }
        std::fs::write(path.join("README.md"), "# Test").unwrap();
        Command::new("git").args(["add", "."]).current_dir(path).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "initial"])
            .current_dir(path)
            .output()
            .unwrap();
    }

    #[test]
    fn create_and_remove_worktree() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let base_dir = tempdir().unwrap();

        let manager = WorktreeManager::new(repo_dir.path(), base_dir.path());
        let info = manager
            .create("feat", 1, "feature/feat/worker-1", "HEAD")
            .unwrap();

        assert!(info.path.exists());
        assert!(info.path.join("README.md").exists());

        manager.remove(&info, false).unwrap();
        assert!(!info.path.exists());
    }

    #[test]
    fn partitions_worktrees_by_worker_id() {
        let repo_dir = tempdir().unwrap();
        init_repo(repo_dir.path());
        let base_dir = tempdir().unwrap();
        let manager = WorktreeManager::new(repo_dir.path(), base_dir.path());

        let a = manager.create("feat", 1, "feature/feat/worker-1", "HEAD").unwrap();
        let b = manager.create("feat", 2, "feature/feat/worker-2", "HEAD").unwrap();
        assert_ne!(a.path, b.path);
    }
}

//! Top-level error aggregation.
//!
//! Every subsystem (state store, task graph, launcher, VCS adapter, merge
//! coordinator, configuration) owns its own error enum so call sites can
//! match on the variants that matter to them. `OrchestratorError` exists only
//! for the handful of call sites — the entry point and the top-level loop —
//! that need one umbrella type to report or abort on.

use crate::config::ConfigError;
use crate::launcher::LaunchError;
use crate::merge::MergeError;
use crate::state::StoreError;
use crate::task_graph::GraphError;
use crate::vcs::VcsError;

/// Whether an error represents a condition the orchestrator can recover from
/// by retrying or pausing, versus one that requires aborting the process.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("task graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("launcher error: {0}")]
    Launch(#[from] LaunchError),

    #[error("vcs error: {0}")]
    Vcs(#[from] VcsError),

    #[error("merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("recoverable error: {0}")]
    Recoverable(String),
}

impl OrchestratorError {
    pub fn recoverable(msg: impl Into<String>) -> Self {
        Self::Recoverable(msg.into())
    }
}

impl Retryable for OrchestratorError {
    fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Config(_) => false,
            OrchestratorError::Graph(_) => false,
            OrchestratorError::Store(e) => e.is_retryable(),
            OrchestratorError::Launch(e) => e.is_retryable(),
            OrchestratorError::Vcs(e) => e.is_retryable(),
            OrchestratorError::Merge(e) => e.is_retryable(),
            OrchestratorError::Recoverable(_) => true,
        }
    }
}

//! Structured logging — span construction plus subscriber setup.
//!
//! Every orchestration-relevant span carries `feature` and the id relevant
//! to its scope (`worker_id`, `task_id`, `level`). Spans scope a level's
//! lifetime, a worker's lifetime, a single task attempt, a merge attempt,
//! and a poll tick, so nested events (gate results, retry attempts) inherit
//! context without repeating it.

use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Build the span scoping one task attempt. The level, worker, poll, and
/// merge spans are built in place via `#[tracing::instrument]` on their
/// owning `Orchestrator` methods; this one is built explicitly because it
/// scopes a sub-span of `check_in_progress_tasks` rather than a whole method.
pub fn task_span(feature: &str, worker_id: u32, task_id: &str) -> Span {
    tracing::info_span!(
        "orchestrator.task",
        feature = feature,
        worker_id = worker_id,
        task_id = task_id,
    )
}

/// Initialize the global `tracing` subscriber from `RUST_LOG`, defaulting to
/// `info` for lifecycle events.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

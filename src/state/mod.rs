//! State store (C1) — durable, crash-safe record of one feature's tasks,
//! workers, levels, and event history.
//!
//! Backed by a single JSON document per feature, written atomically via
//! temp-file-then-rename with a best-effort `.backup` copy. Used both as the
//! orchestrator's working memory and as the resume/reconciliation source of
//! truth: on restart the disk document wins over any in-memory guess.

pub mod store;
pub mod types;

pub use store::{StateStore, StoreError, StoreResult};
pub use types::{
    EventRecord, FeatureState, LevelRecord, LevelStatus, MergeStatus, TaskRecord, TaskStatus,
    WorkerRecord, WorkerStatus,
};

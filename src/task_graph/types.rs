//! Task graph document types — the structured input file a feature is run from.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileSet {
    #[serde(default)]
    pub create: Vec<String>,
    #[serde(default)]
    pub modify: Vec<String>,
    #[serde(default)]
    pub read: Vec<String>,
}

impl FileSet {
    pub fn owned(&self) -> impl Iterator<Item = &str> {
        self.create.iter().chain(self.modify.iter()).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub command: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub level: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files: FileSet,
    pub verification: Verification,
    pub estimate_minutes: Option<u32>,
    #[serde(default)]
    pub critical_path: bool,
    #[serde(default)]
    pub consumers: Vec<String>,
    pub integration_test: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelDecl {
    pub name: Option<String>,
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraphDocument {
    pub feature: String,
    pub version: String,
    pub generated: Option<String>,
    pub total_tasks: usize,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub levels: HashMap<String, LevelDecl>,
    pub max_parallelization: Option<usize>,
}

/// Parse the `<PREFIX>-L<level>-<seq>` id convention, recovering the level
/// number when a task's own `level` field is absent or needs backfilling.
pub fn level_from_id(id: &str) -> Option<u32> {
    let marker = id.find("-L")?;
    let rest = &id[marker + 2..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

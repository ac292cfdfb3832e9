//! Level controller (C7) — in-memory model of task-level structure and
//! status, built once from the task list at startup.

use std::collections::HashMap;

use crate::task_graph::{Task, TaskGraph};

#[derive(Debug, thiserror::Error)]
pub enum LevelError {
    #[error("level {requested} cannot start: level {blocking} is not complete")]
    PriorLevelIncomplete { requested: u32, blocking: u32 },

    #[error("unknown level: {0}")]
    UnknownLevel(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone)]
struct LevelEntry {
    task_ids: Vec<String>,
    outcomes: HashMap<String, TaskOutcome>,
}

impl LevelEntry {
    fn new(task_ids: Vec<String>) -> Self {
        let outcomes = task_ids.iter().map(|id| (id.clone(), TaskOutcome::InProgress)).collect();
        Self { task_ids, outcomes }
    }

    fn is_complete(&self) -> bool {
        self.outcomes.values().all(|o| *o == TaskOutcome::Complete)
    }

    fn is_resolved(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| matches!(o, TaskOutcome::Complete | TaskOutcome::Failed))
    }

    fn progress_percent(&self) -> f64 {
        if self.task_ids.is_empty() {
            return 100.0;
        }
        let done = self
            .outcomes
            .values()
            .filter(|o| matches!(o, TaskOutcome::Complete))
            .count();
        (done as f64 / self.task_ids.len() as f64) * 100.0
    }
}

#[derive(Debug, Clone)]
pub struct LevelStatusSummary {
    pub level: u32,
    pub total: usize,
    pub complete: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub progress_percent: f64,
    pub is_complete: bool,
}

/// Tracks which level is active and how each of its tasks is progressing.
/// Holds no knowledge of workers, retries, or persistence — those live in
/// the state store and retry manager; this is purely the level state machine.
pub struct LevelController {
    levels: HashMap<u32, LevelEntry>,
    ordered_levels: Vec<u32>,
    started: HashMap<u32, bool>,
}

impl LevelController {
    pub fn initialize(tasks: &[Task]) -> Self {
        let mut by_level: HashMap<u32, Vec<String>> = HashMap::new();
        for task in tasks {
            by_level.entry(task.level).or_default().push(task.id.clone());
        }
        let mut ordered_levels: Vec<u32> = by_level.keys().copied().collect();
        ordered_levels.sort_unstable();

        let levels = by_level
            .into_iter()
            .map(|(level, ids)| (level, LevelEntry::new(ids)))
            .collect();

        Self {
            levels,
            ordered_levels,
            started: HashMap::new(),
        }
    }

    pub fn from_graph(graph: &TaskGraph) -> Self {
        Self::initialize(graph.tasks())
    }

    /// Begin a level: returns the task ids to dispatch. Fails if any earlier
    /// level is not yet complete.
    pub fn start_level(&mut self, level: u32) -> Result<Vec<String>, LevelError> {
        for &earlier in &self.ordered_levels {
            if earlier >= level {
                break;
            }
            if !self.is_level_complete(earlier) {
                return Err(LevelError::PriorLevelIncomplete {
                    requested: level,
                    blocking: earlier,
                });
            }
        }
        let entry = self
            .levels
            .get(&level)
            .ok_or(LevelError::UnknownLevel(level))?;
        self.started.insert(level, true);
        Ok(entry.task_ids.clone())
    }

    pub fn is_level_complete(&self, level: u32) -> bool {
        self.levels.get(&level).map(|e| e.is_complete()).unwrap_or(true)
    }

    pub fn is_level_resolved(&self, level: u32) -> bool {
        self.levels.get(&level).map(|e| e.is_resolved()).unwrap_or(true)
    }

    /// True once the current level is resolved and a further level exists.
    pub fn can_advance(&self, current_level: u32) -> bool {
        self.is_level_resolved(current_level)
            && self.ordered_levels.iter().any(|&l| l > current_level)
    }

    /// Returns the next level to run, or `None` if `current_level` was last.
    pub fn advance_level(&self, current_level: u32) -> Option<u32> {
        self.ordered_levels.iter().copied().find(|&l| l > current_level)
    }

    pub fn mark_task_complete(&mut self, level: u32, task_id: &str) {
        if let Some(entry) = self.levels.get_mut(&level) {
            entry.outcomes.insert(task_id.to_string(), TaskOutcome::Complete);
        }
    }

    pub fn mark_task_failed(&mut self, level: u32, task_id: &str) {
        if let Some(entry) = self.levels.get_mut(&level) {
            entry.outcomes.insert(task_id.to_string(), TaskOutcome::Failed);
        }
    }

    pub fn mark_task_in_progress(&mut self, level: u32, task_id: &str) {
        if let Some(entry) = self.levels.get_mut(&level) {
            entry
                .outcomes
                .insert(task_id.to_string(), TaskOutcome::InProgress);
        }
    }

    pub fn get_tasks_for_level(&self, level: u32) -> Vec<String> {
        self.levels.get(&level).map(|e| e.task_ids.clone()).unwrap_or_default()
    }

    pub fn get_pending_tasks_for_level(&self, level: u32) -> Vec<String> {
        self.levels
            .get(&level)
            .map(|e| {
                e.task_ids
                    .iter()
                    .filter(|id| e.outcomes.get(*id) == Some(&TaskOutcome::InProgress))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_level_status(&self, level: u32) -> Option<LevelStatusSummary> {
        let entry = self.levels.get(&level)?;
        let complete = entry
            .outcomes
            .values()
            .filter(|o| matches!(o, TaskOutcome::Complete))
            .count();
        let failed = entry
            .outcomes
            .values()
            .filter(|o| matches!(o, TaskOutcome::Failed))
            .count();
        let in_progress = entry.task_ids.len() - complete - failed;
        Some(LevelStatusSummary {
            level,
            total: entry.task_ids.len(),
            complete,
            failed,
            in_progress,
            progress_percent: entry.progress_percent(),
            is_complete: entry.is_complete(),
        })
    }

    pub fn get_status(&self) -> Vec<LevelStatusSummary> {
        self.ordered_levels
            .iter()
            .filter_map(|&l| self.get_level_status(l))
            .collect()
    }

    pub fn levels(&self) -> &[u32] {
        &self.ordered_levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_graph::{FileSet, Verification};

    fn task(id: &str, level: u32) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            level,
            dependencies: vec![],
            files: FileSet::default(),
            verification: Verification {
                command: "echo ok".to_string(),
                timeout_seconds: 30,
            },
            estimate_minutes: None,
            critical_path: false,
            consumers: vec![],
            integration_test: None,
        }
    }

    #[test]
    fn start_level_rejects_when_earlier_level_incomplete() {
        let tasks = vec![task("A-L1-1", 1), task("A-L2-1", 2)];
        let mut ctrl = LevelController::initialize(&tasks);
        let err = ctrl.start_level(2).unwrap_err();
        assert!(matches!(err, LevelError::PriorLevelIncomplete { .. }));
    }

    #[test]
    fn level_completes_only_when_all_tasks_complete() {
        let tasks = vec![task("A-L1-1", 1), task("A-L1-2", 1)];
        let mut ctrl = LevelController::initialize(&tasks);
        ctrl.start_level(1).unwrap();
        assert!(!ctrl.is_level_complete(1));

        ctrl.mark_task_complete(1, "A-L1-1");
        assert!(!ctrl.is_level_complete(1));

        ctrl.mark_task_complete(1, "A-L1-2");
        assert!(ctrl.is_level_complete(1));
    }

    #[test]
    fn failed_task_blocks_completion_but_allows_resolution() {
        let tasks = vec![task("A-L1-1", 1)];
        let mut ctrl = LevelController::initialize(&tasks);
        ctrl.start_level(1).unwrap();
        ctrl.mark_task_failed(1, "A-L1-1");
        assert!(!ctrl.is_level_complete(1));
        assert!(ctrl.is_level_resolved(1));
    }

    #[test]
    fn advance_level_finds_next_higher_level() {
        let tasks = vec![task("A-L1-1", 1), task("A-L3-1", 3)];
        let ctrl = LevelController::initialize(&tasks);
        assert_eq!(ctrl.advance_level(1), Some(3));
        assert_eq!(ctrl.advance_level(3), None);
    }
}

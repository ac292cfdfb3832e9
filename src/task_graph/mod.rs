//! Task-graph reader (C6) — load, validate, and look up tasks by id and level.

mod helpers;
mod types;

pub use helpers::{critical_path, dependency_closure, find_ownership_conflicts};
pub use types::{level_from_id, FileSet, LevelDecl, Task, TaskGraphDocument, Verification};

use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("failed to read task graph at {path}: {source}")]
    ReadFile {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse task graph: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("task graph invalid: {0}")]
    Invalid(String),
}

/// Loaded and validated task graph, indexed for lookup by id and level.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    doc: TaskGraphDocument,
    by_id: HashMap<String, usize>,
    by_level: HashMap<u32, Vec<String>>,
}

impl TaskGraph {
    /// Load a task graph document from `path` and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| GraphError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let doc: TaskGraphDocument = serde_json::from_str(&text)?;
        Self::from_document(doc)
    }

    pub fn from_document(doc: TaskGraphDocument) -> Result<Self, GraphError> {
        let graph = Self::index(doc);
        graph.validate()?;
        Ok(graph)
    }

    fn index(doc: TaskGraphDocument) -> Self {
        let mut by_id = HashMap::new();
        let mut by_level: HashMap<u32, Vec<String>> = HashMap::new();
        for (idx, task) in doc.tasks.iter().enumerate() {
            by_id.insert(task.id.clone(), idx);
            by_level.entry(task.level).or_default().push(task.id.clone());
        }
        Self { doc, by_id, by_level }
    }

    fn validate(&self) -> Result<(), GraphError> {
        let mut issues = Vec::new();

        // All ids unique.
        let mut seen = HashSet::new();
        for task in &self.doc.tasks {
            if !seen.insert(task.id.as_str()) {
                issues.push(format!("duplicate task id: {}", task.id));
            }
        }

        // Every dependency resolves, and predecessor's level is strictly less.
        for task in &self.doc.tasks {
            for dep in &task.dependencies {
                match self.get(dep) {
                    None => issues.push(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )),
                    Some(predecessor) if predecessor.level >= task.level => issues.push(format!(
                        "task '{}' (level {}) depends on '{}' (level {}), which is not strictly earlier",
                        task.id, task.level, dep, predecessor.level
                    )),
                    Some(_) => {}
                }
            }
        }

        // `create ∪ modify` pairwise disjoint across tasks (I4).
        issues.extend(find_ownership_conflicts(&self.doc.tasks));

        // No dependency cycles.
        if let Some(cycle) = self.detect_cycle() {
            issues.push(format!("dependency cycle detected: {}", cycle.join(" -> ")));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(GraphError::Invalid(issues.join("; ")))
        }
    }

    /// DFS cycle detection over the dependency graph.
    fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut in_stack = HashSet::new();
        let mut path = Vec::new();

        fn dfs(
            node: &str,
            graph: &TaskGraph,
            visited: &mut HashSet<String>,
            in_stack: &mut HashSet<String>,
            path: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            if in_stack.contains(node) {
                let start = path.iter().position(|n| n == node).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(node.to_string());
                return Some(cycle);
            }
            if visited.contains(node) {
                return None;
            }
            visited.insert(node.to_string());
            in_stack.insert(node.to_string());
            path.push(node.to_string());

            if let Some(task) = graph.get(node) {
                for dep in &task.dependencies {
                    if let Some(cycle) = dfs(dep, graph, visited, in_stack, path) {
                        return Some(cycle);
                    }
                }
            }

            path.pop();
            in_stack.remove(node);
            None
        }

        for task in &self.doc.tasks {
            if !visited.contains(&task.id) {
                if let Some(cycle) = dfs(&task.id, self, &mut visited, &mut in_stack, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    pub fn feature(&self) -> &str {
        &self.doc.feature
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.by_id.get(id).map(|&idx| &self.doc.tasks[idx])
    }

    pub fn tasks(&self) -> &[Task] {
        &self.doc.tasks
    }

    pub fn tasks_for_level(&self, level: u32) -> Vec<&Task> {
        self.by_level
            .get(&level)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn levels(&self) -> Vec<u32> {
        let mut levels: Vec<u32> = self.by_level.keys().copied().collect();
        levels.sort_unstable();
        levels
    }

    pub fn total_tasks(&self) -> usize {
        self.doc.tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, level: u32, deps: &[&str], modify: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            level,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            files: FileSet {
                create: vec![],
                modify: modify.iter().map(|s| s.to_string()).collect(),
                read: vec![],
            },
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

    fn doc(tasks: Vec<Task>) -> TaskGraphDocument {
        TaskGraphDocument {
            feature: "test".to_string(),
            version: "1".to_string(),
            generated: None,
            total_tasks: tasks.len(),
            tasks,
            levels: HashMap::new(),
            max_parallelization: None,
        }
    }

    #[test]
    fn valid_graph_loads() {
        let tasks = vec![
            task("A-L1-1", 1, &[], &["a.rs"]),
            task("A-L2-1", 2, &["A-L1-1"], &["b.rs"]),
        ];
        let graph = TaskGraph::from_document(doc(tasks)).unwrap();
        assert_eq!(graph.total_tasks(), 2);
        assert_eq!(graph.levels(), vec![1, 2]);
    }

    #[test]
    fn rejects_unknown_dependency() {
        let tasks = vec![task("A-L1-1", 1, &["missing"], &["a.rs"])];
        let err = TaskGraph::from_document(doc(tasks)).unwrap_err();
        assert!(matches!(err, GraphError::Invalid(_)));
    }

    #[test]
    fn rejects_non_decreasing_dependency_level() {
        let tasks = vec![
            task("A-L1-1", 1, &["A-L2-1"], &["a.rs"]),
            task("A-L2-1", 2, &[], &["b.rs"]),
        ];
        let err = TaskGraph::from_document(doc(tasks)).unwrap_err();
        assert!(err.to_string().contains("strictly earlier"));
    }

    #[test]
    fn rejects_overlapping_file_ownership() {
        let tasks = vec![
            task("A-L1-1", 1, &[], &["shared.rs"]),
            task("A-L1-2", 1, &[], &["shared.rs"]),
        ];
        let err = TaskGraph::from_document(doc(tasks)).unwrap_err();
        assert!(err.to_string().contains("shared.rs"));
    }

    #[test]
    fn rejects_dependency_cycle() {
        let tasks = vec![
            task("A-L1-1", 1, &["A-L1-2"], &["a.rs"]),
            task("A-L1-2", 1, &["A-L1-1"], &["b.rs"]),
        ];
        let err = TaskGraph::from_document(doc(tasks)).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let tasks = vec![
            task("A-L1-1", 1, &[], &["a.rs"]),
            task("A-L1-1", 1, &[], &["b.rs"]),
        ];
        let err = TaskGraph::from_document(doc(tasks)).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}

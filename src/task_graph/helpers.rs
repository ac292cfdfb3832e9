//! Task parser helpers (C8) — pure functions over task records.

use std::collections::{HashMap, HashSet};

use super::types::Task;

/// All transitive predecessors of `id`, in dependency-first (topological) order.
pub fn dependency_closure(tasks: &[Task], id: &str) -> Vec<String> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut visited = HashSet::new();
    let mut result = Vec::new();

    fn visit<'a>(
        id: &str,
        by_id: &HashMap<&'a str, &'a Task>,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if visited.contains(id) {
            return;
        }
        visited.insert(id.to_string());
        if let Some(task) = by_id.get(id) {
            for dep in &task.dependencies {
                visit(dep, by_id, visited, result);
            }
        }
        result.push(id.to_string());
    }

    visit(id, &by_id, &mut visited, &mut result);
    result.pop(); // drop the task itself, only predecessors
    result
}

/// The set of task ids on the longest dependency chain ending at a
/// `critical_path`-flagged task, estimated minutes used as edge weight.
pub fn critical_path(tasks: &[Task]) -> Vec<String> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut best: Vec<String> = Vec::new();
    let mut best_minutes = 0u64;

    for task in tasks.iter().filter(|t| t.critical_path) {
        let chain = dependency_closure(tasks, &task.id);
        let minutes: u64 = chain
            .iter()
            .chain(std::iter::once(&task.id))
            .filter_map(|id| by_id.get(id.as_str()))
            .map(|t| t.estimate_minutes.unwrap_or(0) as u64)
            .sum();
        if minutes >= best_minutes {
            best_minutes = minutes;
            let mut path = chain;
            path.push(task.id.clone());
            best = path;
        }
    }

    best
}

/// Find every pair of tasks whose declared `create ∪ modify` sets overlap
/// (invariant I4). Returns one human-readable issue string per conflict.
pub fn find_ownership_conflicts(tasks: &[Task]) -> Vec<String> {
    let mut issues = Vec::new();
    let mut owner: HashMap<&str, &str> = HashMap::new();

    for task in tasks {
        for path in task.files.owned() {
            if let Some(&prev_owner) = owner.get(path) {
                if prev_owner != task.id {
                    issues.push(format!(
                        "tasks '{}' and '{}' both claim file '{}'",
                        prev_owner, task.id, path
                    ));
                }
            } else {
                owner.insert(path, &task.id);
            }
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_graph::{FileSet, Verification};

    fn task(id: &str, level: u32, deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            level,
            dependencies: deps.iter().map(|s| s.to_string()).collect(),
            files: FileSet::default(),
            verification: Verification {
                command: "echo ok".to_string(),
                timeout_seconds: 30,
            },
            estimate_minutes: Some(10),
            critical_path: false,
            consumers: vec![],
            integration_test: None,
        }
    }

    #[test]
    fn dependency_closure_is_transitive() {
        let tasks = vec![
            task("a", 1, &[]),
            task("b", 2, &["a"]),
            task("c", 3, &["b"]),
        ];
        let closure = dependency_closure(&tasks, "c");
        assert_eq!(closure, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn find_ownership_conflicts_detects_overlap() {
        let mut a = task("a", 1, &[]);
        a.files.modify.push("shared.rs".to_string());
        let mut b = task("b", 1, &[]);
        b.files.create.push("shared.rs".to_string());
        let issues = find_ownership_conflicts(&[a, b]);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("shared.rs"));
    }

    #[test]
    fn find_ownership_conflicts_empty_when_disjoint() {
        let mut a = task("a", 1, &[]);
        a.files.modify.push("a.rs".to_string());
        let mut b = task("b", 1, &[]);
        b.files.modify.push("b.rs".to_string());
        assert!(find_ownership_conflicts(&[a, b]).is_empty());
    }
}

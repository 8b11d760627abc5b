//! Dependency graph for managing task dependencies.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! BTree コンテナを使うので、走査順は常に task id 順（決定的）です。

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::TaskId;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
    reverse_edges: BTreeMap<TaskId, BTreeSet<TaskId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// `task` waits for `depends_on`.
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.reverse_edges
            .entry(depends_on.clone())
            .or_default()
            .insert(task.clone());
        self.edges.entry(task).or_default().insert(depends_on);
    }

    pub fn has_dependencies(&self, task: &TaskId) -> bool {
        self.edges.get(task).is_some_and(|deps| !deps.is_empty())
    }

    pub fn dependencies(&self, task: &TaskId) -> impl Iterator<Item = &TaskId> {
        self.edges.get(task).into_iter().flatten()
    }

    /// Tasks directly waiting for `task`.
    pub fn dependents(&self, task: &TaskId) -> impl Iterator<Item = &TaskId> {
        self.reverse_edges.get(task).into_iter().flatten()
    }

    /// Every task that waits for `task`, directly or transitively.
    pub fn transitive_dependents(&self, task: &TaskId) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&TaskId> = self.dependents(task).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents(next));
            }
        }
        seen
    }

    /// Detects a cycle with a three-colour DFS.
    ///
    /// Returns the first cycle found (in task-id order) as the path
    /// `a -> b -> ... -> a`, or None if the graph is a DAG.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut colors: BTreeMap<&TaskId, Color> = BTreeMap::new();
        let mut path: Vec<&TaskId> = Vec::new();
        for start in self.edges.keys() {
            if colors.get(start).copied().unwrap_or(Color::White) == Color::White
                && let Some(cycle) = self.dfs_cycle(start, &mut colors, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a TaskId,
        colors: &mut BTreeMap<&'a TaskId, Color>,
        path: &mut Vec<&'a TaskId>,
    ) -> Option<Vec<TaskId>> {
        colors.insert(node, Color::Gray);
        path.push(node);
        for dep in self.dependencies(node) {
            match colors.get(dep).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let from = path.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle: Vec<TaskId> = path[from..].iter().map(|n| (*n).clone()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = self.dfs_cycle(dep, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }
        colors.insert(node, Color::Black);
        path.pop();
        None
    }

    /// All tasks that sit on some cycle (a task reachable from itself).
    pub fn tasks_on_cycles(&self) -> BTreeSet<TaskId> {
        self.edges
            .keys()
            .filter(|task| self.reaches(task, task))
            .cloned()
            .collect()
    }

    fn reaches(&self, from: &TaskId, target: &TaskId) -> bool {
        let mut seen: BTreeSet<&TaskId> = BTreeSet::new();
        let mut stack: Vec<&TaskId> = self.dependencies(from).collect();
        while let Some(next) = stack.pop() {
            if next == target {
                return true;
            }
            if seen.insert(next) {
                stack.extend(self.dependencies(next));
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TaskId {
        TaskId::new(s)
    }

    fn graph(edges: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for (task, dep) in edges {
            g.add_dependency(id(task), id(dep));
        }
        g
    }

    #[test]
    fn new_graph_is_empty() {
        let graph = DependencyGraph::new();
        assert!(!graph.has_dependencies(&id("a")));
    }

    #[test]
    fn add_dependency_creates_both_edges() {
        let graph = graph(&[("b", "a")]);
        assert!(graph.has_dependencies(&id("b")));
        assert!(!graph.has_dependencies(&id("a")));
        assert_eq!(graph.dependents(&id("a")).collect::<Vec<_>>(), vec![&id("b")]);
    }

    #[test]
    fn transitive_dependents_follow_chain() {
        let graph = graph(&[("b", "a"), ("c", "b"), ("d", "x")]);
        let deps = graph.transitive_dependents(&id("a"));
        assert_eq!(deps, BTreeSet::from([id("b"), id("c")]));
    }

    #[test]
    fn dag_has_no_cycle() {
        // diamond: d -> b, d -> c, b -> a, c -> a
        let graph = graph(&[("d", "b"), ("d", "c"), ("b", "a"), ("c", "a")]);
        assert!(graph.detect_cycle().is_none());
        assert!(graph.tasks_on_cycles().is_empty());
    }

    #[test]
    fn detects_simple_cycle() {
        let graph = graph(&[("a", "b"), ("b", "c"), ("c", "a")]);
        let cycle = graph.detect_cycle().unwrap();
        assert_eq!(cycle, vec![id("a"), id("b"), id("c"), id("a")]);
    }

    #[test]
    fn detects_self_loop() {
        let graph = graph(&[("a", "a")]);
        assert_eq!(graph.detect_cycle().unwrap(), vec![id("a"), id("a")]);
    }

    #[test]
    fn tasks_on_cycles_excludes_tails() {
        // x waits on the a<->b cycle but is not part of it
        let graph = graph(&[("a", "b"), ("b", "a"), ("x", "a")]);
        assert_eq!(graph.tasks_on_cycles(), BTreeSet::from([id("a"), id("b")]));
    }
}

//! The task graph: nodes keyed by id, with edges derived from each node's
//! declared dependencies.
//!
//! Dependencies may name nodes that are added later; they are only checked
//! by [`TaskGraph::validate`], which also rejects cycles.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{BoxOperator, GraphError, RetryPolicy, TaskNode, TaskState, find_cycle};

/// Point-in-time view of every node's state.
pub type StateSnapshot = HashMap<String, TaskState>;

#[derive(Debug, Clone)]
pub struct TaskGraph {
    graph_id: String,
    nodes: HashMap<String, TaskNode>,
    /// Insertion order, used for deterministic tie-breaking.
    order: Vec<String>,
}

impl TaskGraph {
    pub fn new(graph_id: impl Into<String>) -> Self {
        Self {
            graph_id: graph_id.into(),
            nodes: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn add_node<I, S>(
        &mut self,
        id: impl Into<String>,
        operator: BoxOperator,
        dependencies: I,
        retry_policy: Option<RetryPolicy>,
    ) -> Result<(), GraphError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut node = TaskNode::new(id, operator).depends_on(dependencies);
        if let Some(policy) = retry_policy {
            node = node.retry(policy);
        }
        self.insert(node)
    }

    /// Adds a fully built node.
    pub fn insert(&mut self, node: TaskNode) -> Result<(), GraphError> {
        if self.nodes.contains_key(node.id()) {
            return Err(GraphError::DuplicateId(node.id().to_string()));
        }
        self.order.push(node.id().to_string());
        self.nodes.insert(node.id().to_string(), node);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Checks that every dependency exists and that the graph is acyclic.
    ///
    /// Returns a topological order (dependencies first), breaking ties by
    /// insertion order.
    pub fn validate(&self) -> Result<Vec<String>, GraphError> {
        for id in &self.order {
            if let Some(node) = self.nodes.get(id) {
                if let Some(missing) = node
                    .dependencies()
                    .iter()
                    .find(|dep| !self.nodes.contains_key(*dep))
                {
                    return Err(GraphError::UnknownDependency {
                        node: id.clone(),
                        dependency: missing.clone(),
                    });
                }
            }
        }

        let dependents = self.dependents();
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (id.as_str(), node.dependencies().len()))
            .collect();

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree.get(id).copied() == Some(0))
            .collect();

        let mut sorted = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            sorted.push(id.to_string());
            if let Some(children) = dependents.get(id) {
                for child in children {
                    if let Some(degree) = in_degree.get_mut(child.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(child.as_str());
                        }
                    }
                }
            }
        }

        if sorted.len() != self.nodes.len() {
            let cycle = find_cycle(&self.nodes, &self.order).unwrap_or_default();
            return Err(GraphError::Cycle { cycle });
        }

        Ok(sorted)
    }

    /// Pending nodes whose dependencies have all succeeded.
    ///
    /// Pure function of `snapshot`; results follow insertion order.
    pub fn ready_nodes(&self, snapshot: &StateSnapshot) -> Vec<String> {
        self.nodes()
            .filter(|node| snapshot.get(node.id()) == Some(&TaskState::Pending))
            .filter(|node| {
                node.dependencies()
                    .iter()
                    .all(|dep| snapshot.get(dep) == Some(&TaskState::Succeeded))
            })
            .map(|node| node.id().to_string())
            .collect()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.state()))
            .collect()
    }

    /// Every node reachable from `id` along dependency edges, excluding `id`,
    /// in insertion order.
    pub fn downstream(&self, id: &str) -> Vec<String> {
        let dependents = self.dependents();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);

        while let Some(current) = queue.pop_front() {
            if let Some(children) = dependents.get(current) {
                for child in children {
                    if seen.insert(child.as_str()) {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }

        self.order
            .iter()
            .filter(|n| n.as_str() != id && seen.contains(n.as_str()))
            .cloned()
            .collect()
    }

    /// Renders the graph as an indented tree from each root, e.g.
    ///
    /// ```text
    /// begin
    ///   └─> stage_flag
    ///       └─> check_stage
    /// ```
    ///
    /// A node with several dependencies is listed under each of them, but
    /// its own subtree is expanded only the first time. Later occurrences
    /// are marked `(*)`.
    pub fn render_tree(&self) -> String {
        let dependents = self.dependents();
        let mut expanded = HashSet::new();
        let mut out = String::new();

        fn chain<'a>(
            name: &str,
            prefix: &str,
            dependents: &HashMap<&str, Vec<&'a String>>,
            expanded: &mut HashSet<&'a str>,
            out: &mut String,
        ) {
            let Some(children) = dependents.get(name) else {
                return;
            };
            for child in children {
                if expanded.insert(child.as_str()) {
                    out.push_str(&format!("{prefix}└─> {child}\n"));
                    chain(child, &format!("{prefix}    "), dependents, expanded, out);
                } else {
                    out.push_str(&format!("{prefix}└─> {child} (*)\n"));
                }
            }
        }

        for node in self.nodes().filter(|n| n.dependencies().is_empty()) {
            out.push_str(node.id());
            out.push('\n');
            chain(node.id(), "  ", &dependents, &mut expanded, &mut out);
        }
        out
    }

    pub(crate) fn set_state(&mut self, id: &str, state: TaskState) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.state = state;
        }
    }

    pub(crate) fn reset_states(&mut self) {
        for node in self.nodes.values_mut() {
            node.state = TaskState::Pending;
        }
    }

    /// Reverse edges: dependency id -> ids that depend on it.
    fn dependents(&self) -> HashMap<&str, Vec<&String>> {
        let mut dependents: HashMap<&str, Vec<&String>> = HashMap::new();
        for id in &self.order {
            if let Some(node) = self.nodes.get(id) {
                for dep in node.dependencies() {
                    dependents.entry(dep.as_str()).or_default().push(id);
                }
            }
        }
        dependents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoopOperator;
    use std::sync::Arc;

    fn add(graph: &mut TaskGraph, id: &str, deps: &[&str]) -> Result<(), GraphError> {
        graph.add_node(id, Arc::new(NoopOperator), deps.iter().copied(), None)
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut graph = TaskGraph::new("g");
        add(&mut graph, "a", &[]).unwrap();
        assert_eq!(
            add(&mut graph, "a", &[]),
            Err(GraphError::DuplicateId("a".into()))
        );
    }

    #[test]
    fn forward_references_resolve_at_validation() {
        let mut graph = TaskGraph::new("g");
        add(&mut graph, "load", &["stage"]).unwrap();
        add(&mut graph, "stage", &[]).unwrap();
        assert_eq!(graph.validate().unwrap(), vec!["stage", "load"]);
    }

    #[test]
    fn unknown_dependency_rejected() {
        let mut graph = TaskGraph::new("g");
        add(&mut graph, "load", &["stage"]).unwrap();
        assert_eq!(
            graph.validate(),
            Err(GraphError::UnknownDependency {
                node: "load".into(),
                dependency: "stage".into()
            })
        );
    }

    #[test]
    fn cycle_rejected() {
        let mut graph = TaskGraph::new("g");
        add(&mut graph, "a", &["b"]).unwrap();
        add(&mut graph, "b", &["a"]).unwrap();
        add(&mut graph, "c", &[]).unwrap();
        match graph.validate() {
            Err(GraphError::Cycle { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn chains_of_any_length_validate() {
        for len in 1..20 {
            let mut graph = TaskGraph::new("chain");
            for i in 0..len {
                let deps: Vec<String> = if i == 0 { vec![] } else { vec![format!("n{}", i - 1)] };
                graph
                    .add_node(format!("n{i}"), Arc::new(NoopOperator), deps, None)
                    .unwrap();
            }
            assert_eq!(graph.validate().unwrap().len(), len);

            // closing the chain into a ring must fail
            let mut ring = graph.clone();
            ring.add_node("closer", Arc::new(NoopOperator), [format!("n{}", len - 1)], None)
                .unwrap();
            let mut nodes = ring.nodes.clone();
            let first = nodes.remove("n0").unwrap().depends_on(["closer"]);
            nodes.insert("n0".into(), first);
            ring.nodes = nodes;
            assert!(matches!(ring.validate(), Err(GraphError::Cycle { .. })));
        }
    }

    #[test]
    fn ready_nodes_enforce_fan_in() {
        let mut graph = TaskGraph::new("g");
        add(&mut graph, "a", &[]).unwrap();
        add(&mut graph, "b", &[]).unwrap();
        add(&mut graph, "gate", &["a", "b"]).unwrap();

        let mut snapshot = graph.snapshot();
        assert_eq!(graph.ready_nodes(&snapshot), vec!["a", "b"]);

        snapshot.insert("a".into(), TaskState::Succeeded);
        snapshot.insert("b".into(), TaskState::Running);
        assert!(graph.ready_nodes(&snapshot).is_empty());

        snapshot.insert("b".into(), TaskState::Failed);
        assert!(graph.ready_nodes(&snapshot).is_empty());

        snapshot.insert("b".into(), TaskState::Succeeded);
        assert_eq!(graph.ready_nodes(&snapshot), vec!["gate"]);
    }

    #[test]
    fn renders_tree_from_roots() {
        let mut graph = TaskGraph::new("g");
        add(&mut graph, "begin", &[]).unwrap();
        add(&mut graph, "stage", &["begin"]).unwrap();
        add(&mut graph, "check", &["stage"]).unwrap();
        assert_eq!(
            graph.render_tree(),
            "begin\n  └─> stage\n      └─> check\n"
        );
    }

    #[test]
    fn shared_subtrees_render_once() {
        let mut graph = TaskGraph::new("g");
        add(&mut graph, "begin", &[]).unwrap();
        add(&mut graph, "stage_a", &["begin"]).unwrap();
        add(&mut graph, "stage_b", &["begin"]).unwrap();
        add(&mut graph, "load", &["stage_a", "stage_b"]).unwrap();
        add(&mut graph, "check", &["load"]).unwrap();
        assert_eq!(
            graph.render_tree(),
            "begin\n\
             \x20 └─> stage_a\n\
             \x20     └─> load\n\
             \x20         └─> check\n\
             \x20 └─> stage_b\n\
             \x20     └─> load (*)\n"
        );
    }

    #[test]
    fn fan_in_ladder_stays_linear() {
        // each rung depends on both nodes of the previous rung
        let mut graph = TaskGraph::new("g");
        add(&mut graph, "l0", &[]).unwrap();
        add(&mut graph, "r0", &[]).unwrap();
        for i in 1..20 {
            let prev = [format!("l{}", i - 1), format!("r{}", i - 1)];
            let deps: Vec<&str> = prev.iter().map(String::as_str).collect();
            add(&mut graph, &format!("l{i}"), &deps).unwrap();
            add(&mut graph, &format!("r{i}"), &deps).unwrap();
        }
        let tree = graph.render_tree();
        assert_eq!(tree.lines().count(), 2 + 2 * 19 * 2);
        assert_eq!(tree.matches("(*)").count(), 2 * 19);
    }

    #[test]
    fn downstream_is_transitive() {
        let mut graph = TaskGraph::new("g");
        add(&mut graph, "a", &[]).unwrap();
        add(&mut graph, "b", &["a"]).unwrap();
        add(&mut graph, "c", &["b"]).unwrap();
        add(&mut graph, "d", &[]).unwrap();
        add(&mut graph, "e", &["c", "d"]).unwrap();

        assert_eq!(graph.downstream("a"), vec!["b", "c", "e"]);
        assert_eq!(graph.downstream("d"), vec!["e"]);
        assert!(graph.downstream("e").is_empty());
    }
}

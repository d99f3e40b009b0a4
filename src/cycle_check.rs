use std::collections::{HashMap, HashSet};

use crate::TaskNode;

/// Searches the dependency relation for a cycle.
///
/// Roots are visited in `order` so the reported cycle is deterministic.
/// Returns the cycle as a closed path, e.g. `["a", "b", "a"]`, following
/// dependency edges. Dependencies that name unknown nodes are ignored here.
pub fn find_cycle(nodes: &HashMap<String, TaskNode>, order: &[String]) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut path: Vec<String> = Vec::new();

    fn dfs(
        name: &str,
        nodes: &HashMap<String, TaskNode>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|p| p == name) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(name.to_string());
            return Some(cycle);
        }
        if visited.contains(name) {
            return None;
        }

        visited.insert(name.to_string());
        path.push(name.to_string());

        if let Some(node) = nodes.get(name) {
            for dep in node.dependencies() {
                if let Some(cycle) = dfs(dep, nodes, visited, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        None
    }

    for name in order {
        if !visited.contains(name) {
            if let Some(cycle) = dfs(name, nodes, &mut visited, &mut path) {
                return Some(cycle);
            }
        }
    }

    None
}

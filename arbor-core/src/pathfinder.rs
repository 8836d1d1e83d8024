//! Reachability and path enumeration over the transition graph.
//!
//! Both queries look at transition structure only; guards are not evaluated.

use crate::content::Content;
use crate::node::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

/// One node on a path, with the transition that led to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStep {
    #[serde(skip)]
    pub node: Option<NodeId>,
    pub node_name: String,
    pub persistent_id: String,
    /// Empty for the starting node.
    pub transition_id: String,
    pub transition_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Path {
    pub steps: Vec<PathStep>,
}

impl Path {
    /// Number of transitions on the path.
    pub fn len(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.len() <= 1
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.steps.iter().filter_map(|s| s.node)
    }

    pub fn describe(&self) -> String {
        self.steps
            .iter()
            .map(|s| s.node_name.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

fn step(content: &Content, node: NodeId, via: Option<(&str, &str)>) -> PathStep {
    let n = content.node(node);
    let (transition_id, transition_name) = via.unwrap_or(("", ""));
    PathStep {
        node: Some(node),
        node_name: n.map(|n| n.name.clone()).unwrap_or_default(),
        persistent_id: n.map(|n| n.persistent_id.clone()).unwrap_or_default(),
        transition_id: transition_id.to_string(),
        transition_name: transition_name.to_string(),
    }
}

/// Breadth-first reachability. Terminates on cyclic graphs.
pub fn can_reach(content: &Content, start: NodeId, target: NodeId) -> bool {
    if start == target {
        return content.node(start).is_some();
    }

    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    visited.insert(start);
    queue.push_back(start);

    while let Some(id) = queue.pop_front() {
        let Some(node) = content.node(id) else { continue };
        for next in node.transitions.iter().filter_map(|t| t.target) {
            if next == target {
                return true;
            }
            if visited.insert(next) {
                queue.push_back(next);
            }
        }
    }
    false
}

/// Depth-first enumeration of simple paths from `start` to `target`.
///
/// Returns at most `max_paths` paths, none with more than `max_depth`
/// transitions, and none visiting a node twice. Transitions are followed in
/// evaluation order, so higher-priority routes are found first.
pub fn find_paths(content: &Content, start: NodeId, target: NodeId, max_paths: usize, max_depth: usize) -> Vec<Path> {
    let mut found = Vec::new();
    if max_paths == 0 || content.node(start).is_none() {
        return found;
    }
    if start == target {
        found.push(Path {
            steps: vec![step(content, start, None)],
        });
        return found;
    }

    let mut on_path = HashSet::new();
    on_path.insert(start);
    let mut current = vec![step(content, start, None)];
    walk(
        content,
        start,
        target,
        max_paths,
        max_depth,
        &mut on_path,
        &mut current,
        &mut found,
    );
    found
}

#[allow(clippy::too_many_arguments)]
fn walk(
    content: &Content,
    at: NodeId,
    target: NodeId,
    max_paths: usize,
    max_depth: usize,
    on_path: &mut HashSet<NodeId>,
    current: &mut Vec<PathStep>,
    found: &mut Vec<Path>,
) {
    // `current` holds one more step than it has transitions.
    if current.len() > max_depth {
        return;
    }
    let Some(node) = content.node(at) else { return };

    for transition in node.ordered_transitions() {
        if found.len() >= max_paths {
            return;
        }
        let Some(next) = transition.target else { continue };
        if on_path.contains(&next) {
            continue;
        }

        current.push(step(content, next, Some((&transition.id, &transition.name))));
        if next == target {
            found.push(Path {
                steps: current.clone(),
            });
        } else {
            on_path.insert(next);
            walk(content, next, target, max_paths, max_depth, on_path, current, found);
            on_path.remove(&next);
        }
        current.pop();
    }
}

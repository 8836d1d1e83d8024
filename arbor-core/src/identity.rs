//! Persistent node identity.
//!
//! Every node gets a slash-delimited path under its system root
//! (`WorldSystem/Region/Location`); the root's own id is the system name.
//! Nodes that are not part of any child tree but are reachable through
//! transitions from a system get `<system>/<name>`. These ids are what save
//! files reference, so they must survive a rebuild of the arena where raw
//! [`NodeId`]s would not.
//!
//! Ids are unique. When a path is already taken, by a same-named sibling or
//! by a transition-only tree whose name collides with a child of the root,
//! the later node in walk order gets a `~<n>` suffix (`Town/Guard~1`).

use crate::content::Content;
use crate::node::NodeId;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

/// How a persistent id was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Found in the index as-is.
    Exact(NodeId),
    /// Matched by trailing name in a child tree. `resolve_strict` rewrites
    /// the node's id to the requested path; `lookup` does not.
    Healed(NodeId),
    /// Matched by trailing name among transition-only nodes.
    Dynamic(NodeId),
    /// Nothing matched; the requesting system's root was substituted.
    Fallback(NodeId),
    Unresolved,
}

impl Resolution {
    pub fn node(&self) -> Option<NodeId> {
        match self {
            Resolution::Exact(id)
            | Resolution::Healed(id)
            | Resolution::Dynamic(id)
            | Resolution::Fallback(id) => Some(*id),
            Resolution::Unresolved => None,
        }
    }

    /// True unless the root fallback was used or nothing matched.
    pub fn is_match(&self) -> bool {
        matches!(
            self,
            Resolution::Exact(_) | Resolution::Healed(_) | Resolution::Dynamic(_)
        )
    }
}

/// Node name a path segment was built from, without any `~<n>` suffix.
fn segment_name(segment: &str) -> &str {
    match segment.rsplit_once('~') {
        Some((name, n)) if !name.is_empty() && !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => segment,
    }
}

fn trailing_name(pid: &str) -> &str {
    segment_name(pid.rsplit('/').next().unwrap_or(pid))
}

fn parent_segment(pid: &str) -> Option<&str> {
    let mut parts = pid.rsplit('/');
    parts.next();
    parts.next().map(segment_name)
}

/// Returns `candidate`, or the first free `candidate~<n>`, and marks it taken.
fn claim_pid(candidate: String, taken: &mut HashSet<String>) -> String {
    if taken.insert(candidate.clone()) {
        return candidate;
    }
    let mut n = 1;
    loop {
        let pid = format!("{}~{}", candidate, n);
        if taken.insert(pid.clone()) {
            return pid;
        }
        n += 1;
    }
}

fn system_segment(pid: &str) -> &str {
    pid.split('/').next().unwrap_or(pid)
}

impl Content {
    /// Assigns persistent ids to every node reachable from a registered
    /// system, fills in empty transition ids and rebuilds the index.
    ///
    /// Running it twice on an unchanged arena yields the same ids.
    pub fn assign_persistent_ids(&mut self) {
        let mut assigned: Vec<(NodeId, String)> = Vec::new();
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut taken: HashSet<String> = HashSet::new();

        let systems: Vec<(String, NodeId)> = self
            .systems
            .iter()
            .map(|(name, root)| (name.clone(), *root))
            .collect();

        for (system, root) in &systems {
            self.walk_tree(*root, system.clone(), &mut assigned, &mut seen, &mut taken);
        }

        // Transition-only nodes, discovered breadth-first from each system.
        for (system, root) in &systems {
            let mut queue: VecDeque<NodeId> = self.subtree(*root).into();
            let mut visited: HashSet<NodeId> = queue.iter().copied().collect();
            while let Some(id) = queue.pop_front() {
                let Some(node) = self.node(id) else { continue };
                let targets: Vec<NodeId> = node.transitions.iter().filter_map(|t| t.target).collect();
                for target in targets {
                    if !visited.insert(target) {
                        continue;
                    }
                    if !seen.contains(&target) {
                        let top = self.tree_root(target);
                        if let Some(top_node) = self.node(top) {
                            let base = format!("{}/{}", system, top_node.name);
                            self.walk_tree(top, base, &mut assigned, &mut seen, &mut taken);
                        }
                        for member in self.subtree(top) {
                            if visited.insert(member) {
                                queue.push_back(member);
                            }
                        }
                    }
                    queue.push_back(target);
                }
            }
        }

        self.index.clear();
        for (id, pid) in assigned {
            self.index.insert(pid.clone(), id);
            if let Some(node) = self.node_mut(id) {
                for (idx, transition) in node.transitions.iter_mut().enumerate() {
                    if transition.id.is_empty() {
                        transition.id = format!("{}#{}", pid, idx);
                    }
                }
                node.persistent_id = pid;
            }
        }
        debug!(indexed = self.index.len(), "assigned persistent ids");
    }

    fn walk_tree(
        &self,
        root: NodeId,
        root_pid: String,
        assigned: &mut Vec<(NodeId, String)>,
        seen: &mut HashSet<NodeId>,
        taken: &mut HashSet<String>,
    ) {
        let mut stack = vec![(root, root_pid)];
        while let Some((id, candidate)) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = self.node(id) else { continue };
            let pid = claim_pid(candidate, taken);
            if !pid.ends_with(node.name.as_str()) {
                debug!(node = %node.name, persistent_id = %pid, "persistent id disambiguated");
            }
            for child in node.children.iter().rev() {
                if let Some(child_node) = self.node(*child) {
                    stack.push((*child, format!("{}/{}", pid, child_node.name)));
                }
            }
            assigned.push((id, pid));
        }
    }

    /// Finds the node a persistent id refers to, trying in order: the index;
    /// a node with the same trailing name in any system's child tree; a
    /// transition-only node with that name. Never modifies ids or the index.
    pub fn lookup(&self, pid: &str) -> Resolution {
        if let Some(id) = self.index.get(pid) {
            return Resolution::Exact(*id);
        }
        if pid.is_empty() {
            return Resolution::Unresolved;
        }

        let name = trailing_name(pid);
        let parent_name = parent_segment(pid);
        let system = system_segment(pid);

        let tree_nodes: HashSet<NodeId> = self
            .systems
            .values()
            .flat_map(|root| self.subtree(*root))
            .collect();

        // Prefer a candidate whose parent matches the path's parent segment,
        // then one inside the path's own system.
        let best = self
            .systems
            .iter()
            .flat_map(|(sys, root)| self.subtree(*root).into_iter().map(move |id| (sys.as_str(), id)))
            .filter(|(_, id)| self.node(*id).map(|n| n.name == name).unwrap_or(false))
            .max_by_key(|(sys, id)| {
                let parent_match = parent_name.is_some()
                    && self
                        .node(*id)
                        .and_then(|n| n.parent)
                        .and_then(|p| self.node(p))
                        .map(|p| Some(p.name.as_str()) == parent_name)
                        .unwrap_or(false);
                // max_by_key keeps the last maximum; invert the index so the
                // earliest node wins ties.
                (parent_match, *sys == system, u32::MAX - id.0)
            })
            .map(|(_, id)| id);

        if let Some(id) = best {
            return Resolution::Healed(id);
        }

        let mut order: Vec<NodeId> = tree_nodes.iter().copied().collect();
        order.sort();
        let mut queue: VecDeque<NodeId> = order.into();
        let mut visited = tree_nodes;
        while let Some(id) = queue.pop_front() {
            let Some(node) = self.node(id) else { continue };
            for target in node.transitions.iter().filter_map(|t| t.target) {
                if !visited.insert(target) {
                    continue;
                }
                if self.node(target).map(|n| n.name == name).unwrap_or(false) {
                    return Resolution::Dynamic(target);
                }
                queue.push_back(target);
            }
        }

        Resolution::Unresolved
    }

    /// [`Content::lookup`], then records the match: a healed node takes the
    /// requested path as its id, and a dynamic match is indexed under it.
    pub fn resolve_strict(&mut self, pid: &str) -> Resolution {
        let resolution = self.lookup(pid);
        match resolution {
            Resolution::Healed(id) => self.heal(id, pid),
            Resolution::Dynamic(id) => {
                self.index.insert(pid.to_string(), id);
            }
            _ => {}
        }
        resolution
    }

    /// Like [`Content::resolve_strict`], falling back to the root of
    /// `fallback_system` with a warning.
    pub fn resolve(&mut self, pid: &str, fallback_system: &str) -> Resolution {
        let resolution = self.resolve_strict(pid);
        if resolution.node().is_some() {
            return resolution;
        }
        match self.system_root(fallback_system) {
            Some(root) => {
                warn!(persistent_id = %pid, system = %fallback_system, "node not found; falling back to system root");
                Resolution::Fallback(root)
            }
            None => {
                warn!(persistent_id = %pid, system = %fallback_system, "node not found and system has no root");
                Resolution::Unresolved
            }
        }
    }

    fn heal(&mut self, id: NodeId, pid: &str) {
        let Some(node) = self.node_mut(id) else { return };
        let old = std::mem::replace(&mut node.persistent_id, pid.to_string());
        warn!(from = %old, to = %pid, "persistent id healed by name match");
        if self.index.get(&old) == Some(&id) {
            self.index.remove(&old);
        }
        self.index.insert(pid.to_string(), id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeKind, Transition};

    fn world() -> (Content, NodeId, NodeId, NodeId) {
        let mut content = Content::new();
        let root = content.add_node(Node::new("WorldSystem", NodeKind::Root));
        let region = content.add_node(Node::new("Vale", NodeKind::Region));
        let town = content.add_node(Node::new("Millbrook", NodeKind::Location));
        content.add_child(root, region).unwrap();
        content.add_child(region, town).unwrap();
        content.add_transition(root, Transition::new("enter", region)).unwrap();
        content.register_system("WorldSystem", root).unwrap();
        (content, root, region, town)
    }

    #[test]
    fn test_paths_follow_tree() {
        let (content, root, region, town) = world();
        assert_eq!(content.node(root).unwrap().persistent_id, "WorldSystem");
        assert_eq!(content.node(region).unwrap().persistent_id, "WorldSystem/Vale");
        assert_eq!(content.node(town).unwrap().persistent_id, "WorldSystem/Vale/Millbrook");
        assert_eq!(content.find_by_pid("WorldSystem/Vale/Millbrook"), Some(town));
        assert_eq!(content.node(root).unwrap().transitions[0].id, "WorldSystem#0");
    }

    #[test]
    fn test_assignment_is_idempotent() {
        let (mut content, _root, _region, _town) = world();
        let before: Vec<String> = content.nodes().map(|n| n.persistent_id.clone()).collect();
        content.assign_persistent_ids();
        let after: Vec<String> = content.nodes().map(|n| n.persistent_id.clone()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_dynamic_nodes_named_under_system() {
        let (mut content, root, _region, _town) = world();
        let cave = content.add_node(Node::new("Cave", NodeKind::Location));
        content.add_transition(root, Transition::new("fall", cave)).unwrap();
        content.assign_persistent_ids();
        assert_eq!(content.node(cave).unwrap().persistent_id, "WorldSystem/Cave");
        assert_eq!(content.resolve_strict("WorldSystem/Cave"), Resolution::Exact(cave));
    }

    #[test]
    fn test_heal_by_trailing_name() {
        let (mut content, _root, _region, town) = world();
        let resolution = content.resolve_strict("WorldSystem/OldVale/Millbrook");
        assert_eq!(resolution, Resolution::Healed(town));
        assert_eq!(content.node(town).unwrap().persistent_id, "WorldSystem/OldVale/Millbrook");
        assert_eq!(content.find_by_pid("WorldSystem/OldVale/Millbrook"), Some(town));
        assert_eq!(content.find_by_pid("WorldSystem/Vale/Millbrook"), None);
    }

    #[test]
    fn test_heal_prefers_matching_parent() {
        let (mut content, root, region, _town) = world();
        let other = content.add_node(Node::new("Coast", NodeKind::Region));
        content.add_child(root, other).unwrap();
        let coast_town = content.add_node(Node::new("Millbrook", NodeKind::Location));
        content.add_child(other, coast_town).unwrap();
        content.assign_persistent_ids();
        assert_eq!(content.node(coast_town).unwrap().persistent_id, "WorldSystem/Coast/Millbrook");
        assert_eq!(content.node(region).unwrap().children.len(), 1);

        let resolution = content.resolve_strict("Legacy/Coast/Millbrook");
        assert_eq!(resolution, Resolution::Healed(coast_town));
    }

    #[test]
    fn test_fallback_to_system_root() {
        let (mut content, root, _region, _town) = world();
        assert_eq!(content.resolve("WorldSystem/Nowhere", "WorldSystem"), Resolution::Fallback(root));
        assert_eq!(content.resolve("WorldSystem/Nowhere", "Missing"), Resolution::Unresolved);
        assert!(!Resolution::Fallback(root).is_match());
    }

    #[test]
    fn test_same_named_siblings_get_distinct_ids() {
        let (mut content, _root, region, town) = world();
        let second = content.add_node(Node::new("Millbrook", NodeKind::Location));
        let inn = content.add_node(Node::basic("Inn"));
        content.add_child(region, second).unwrap();
        content.add_child(second, inn).unwrap();
        content.assign_persistent_ids();

        assert_eq!(content.node(town).unwrap().persistent_id, "WorldSystem/Vale/Millbrook");
        assert_eq!(content.node(second).unwrap().persistent_id, "WorldSystem/Vale/Millbrook~1");
        assert_eq!(content.node(inn).unwrap().persistent_id, "WorldSystem/Vale/Millbrook~1/Inn");
        assert_eq!(content.find_by_pid("WorldSystem/Vale/Millbrook~1"), Some(second));

        content.assign_persistent_ids();
        assert_eq!(content.node(second).unwrap().persistent_id, "WorldSystem/Vale/Millbrook~1");
    }

    #[test]
    fn test_dynamic_tree_colliding_with_child_is_suffixed() {
        let (mut content, root, region, _town) = world();
        let detached = content.add_node(Node::new("Vale", NodeKind::Region));
        content.add_transition(root, Transition::new("dream", detached)).unwrap();
        content.assign_persistent_ids();
        assert_eq!(content.node(region).unwrap().persistent_id, "WorldSystem/Vale");
        assert_eq!(content.node(detached).unwrap().persistent_id, "WorldSystem/Vale~1");
    }

    #[test]
    fn test_suffixed_id_heals_by_base_name() {
        let (mut content, _root, _region, town) = world();
        assert_eq!(content.resolve_strict("WorldSystem/Vale~3/Millbrook~2"), Resolution::Healed(town));
    }

    #[test]
    fn test_lookup_leaves_ids_alone() {
        let (content, _root, _region, town) = world();
        assert_eq!(content.lookup("WorldSystem/OldVale/Millbrook"), Resolution::Healed(town));
        assert_eq!(content.node(town).unwrap().persistent_id, "WorldSystem/Vale/Millbrook");
        assert_eq!(content.find_by_pid("WorldSystem/OldVale/Millbrook"), None);
    }
}

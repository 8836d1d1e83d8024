//! Node arena and system registry.

use crate::action::Action;
use crate::error::CoreError;
use crate::node::{Node, NodeId, Transition};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{info, warn};

/// Owns every node of every system.
///
/// Nodes are addressed by [`NodeId`] and never freed individually. Child
/// links form a forest (each node has at most one parent); transitions may
/// point anywhere in the arena.
#[derive(Debug, Clone, Default)]
pub struct Content {
    pub(crate) nodes: Vec<Node>,
    pub(crate) systems: BTreeMap<String, NodeId>,
    /// Persistent id -> node, rebuilt by `assign_persistent_ids`.
    pub(crate) index: HashMap<String, NodeId>,
}

impl Content {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Moves a node into the arena and returns its id.
    pub fn add_node(&mut self, mut node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        node.id = id;
        node.parent = None;
        node.children.clear();
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index())
    }

    fn require(&self, id: NodeId) -> Result<&Node, CoreError> {
        self.node(id).ok_or_else(|| CoreError::NodeNotFound {
            node: id.to_string(),
        })
    }

    fn require_mut(&mut self, id: NodeId) -> Result<&mut Node, CoreError> {
        self.node_mut(id).ok_or_else(|| CoreError::NodeNotFound {
            node: id.to_string(),
        })
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Attaches `child` under `parent`. Rejects a second parent and any link
    /// that would make the child tree cyclic.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), CoreError> {
        self.require(parent)?;
        let child_node = self.require(child)?;
        if let Some(existing) = child_node.parent {
            return Err(CoreError::InvalidContent {
                reason: format!("node {} already has parent {}", child, existing),
            });
        }
        if self.systems.values().any(|root| *root == child) {
            return Err(CoreError::InvalidContent {
                reason: format!("node {} is a system root", child),
            });
        }

        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            if id == child {
                return Err(CoreError::InvalidContent {
                    reason: format!("attaching {} under {} creates a cycle", child, parent),
                });
            }
            cursor = self.node(id).and_then(|n| n.parent);
        }

        self.require_mut(child)?.parent = Some(parent);
        self.require_mut(parent)?.children.push(child);
        Ok(())
    }

    pub fn add_transition(&mut self, from: NodeId, transition: Transition) -> Result<(), CoreError> {
        if let Some(target) = transition.target {
            self.require(target)?;
        }
        self.require_mut(from)?.transitions.push(transition);
        Ok(())
    }

    pub fn add_entry_action(&mut self, node: NodeId, action: Action) -> Result<(), CoreError> {
        self.require_mut(node)?.entry_actions.push(action);
        Ok(())
    }

    pub fn add_exit_action(&mut self, node: NodeId, action: Action) -> Result<(), CoreError> {
        self.require_mut(node)?.exit_actions.push(action);
        Ok(())
    }

    pub fn set_accepting(&mut self, node: NodeId, accepting: bool) -> Result<(), CoreError> {
        self.require_mut(node)?.accepting = accepting;
        Ok(())
    }

    pub fn set_state(
        &mut self,
        node: NodeId,
        key: impl Into<String>,
        value: crate::value::Value,
    ) -> Result<(), CoreError> {
        self.require_mut(node)?.state.insert(key.into(), value);
        Ok(())
    }

    /// Registers `root` as the root of system `name` and reassigns persistent ids.
    pub fn register_system(&mut self, name: impl Into<String>, root: NodeId) -> Result<(), CoreError> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(CoreError::InvalidContent {
                reason: format!("invalid system name '{}'", name),
            });
        }
        if let Some(parent) = self.require(root)?.parent {
            return Err(CoreError::InvalidContent {
                reason: format!("system root {} is a child of {}", root, parent),
            });
        }
        if let Some(previous) = self.systems.insert(name.clone(), root) {
            if previous != root {
                warn!(system = %name, "system re-registered with a different root");
            }
        }
        self.assign_persistent_ids();
        info!(system = %name, root = %root, nodes = self.subtree(root).len(), "registered system");
        Ok(())
    }

    pub fn system_root(&self, name: &str) -> Option<NodeId> {
        self.systems.get(name).copied()
    }

    pub fn systems(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.systems.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn is_system_root(&self, id: NodeId) -> bool {
        self.systems.values().any(|root| *root == id)
    }

    /// Exact persistent-id lookup.
    pub fn find_by_pid(&self, pid: &str) -> Option<NodeId> {
        self.index.get(pid).copied()
    }

    /// Depth-first pre-order walk of the child tree rooted at `root`.
    pub fn subtree(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(node) = self.node(id) else { continue };
            out.push(id);
            stack.extend(node.children.iter().rev().copied());
        }
        out
    }

    /// Every node that belongs to the system rooted at `root`: its child
    /// tree in pre-order, followed by the trees of nodes reachable only
    /// through transitions. Trees owned by other systems are excluded; a
    /// transition-only tree reachable from several systems belongs to the
    /// one whose name its persistent id carries.
    pub fn system_nodes(&self, root: NodeId) -> Vec<NodeId> {
        let system = self.node(root).map(|n| n.persistent_id.as_str()).unwrap_or_default();
        let owned_elsewhere = |top: NodeId| {
            self.node(top)
                .and_then(|n| n.persistent_id.split('/').next())
                .map(|owner| !owner.is_empty() && !system.is_empty() && owner != system)
                .unwrap_or(false)
        };
        let mut out = self.subtree(root);
        let mut member: HashSet<NodeId> = out.iter().copied().collect();
        let mut cursor = 0;
        while cursor < out.len() {
            let id = out[cursor];
            cursor += 1;
            let Some(node) = self.node(id) else { continue };
            for target in node.transitions.iter().filter_map(|t| t.target) {
                if member.contains(&target) {
                    continue;
                }
                let top = self.tree_root(target);
                if self.is_system_root(top) || owned_elsewhere(top) {
                    continue;
                }
                for n in self.subtree(top) {
                    if member.insert(n) {
                        out.push(n);
                    }
                }
            }
        }
        out
    }

    pub fn find_child_by_name(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.node(parent)?
            .children
            .iter()
            .copied()
            .find(|c| self.node(*c).map(|n| n.name == name).unwrap_or(false))
    }

    /// Walks up the parent chain to the top of the tree containing `id`.
    pub fn tree_root(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(parent) = self.node(current).and_then(|n| n.parent) {
            current = parent;
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> (Content, NodeId, NodeId, NodeId) {
        let mut content = Content::new();
        let root = content.add_node(Node::basic("Root"));
        let a = content.add_node(Node::basic("A"));
        let b = content.add_node(Node::basic("B"));
        content.add_child(root, a).unwrap();
        content.add_child(a, b).unwrap();
        (content, root, a, b)
    }

    #[test]
    fn test_single_parent() {
        let (mut content, root, _a, b) = tree();
        assert!(content.add_child(root, b).is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let (mut content, root, _a, b) = tree();
        let err = content.add_child(b, root).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONTENT");
        assert!(content.add_child(b, b).is_err());
    }

    #[test]
    fn test_transition_target_must_exist() {
        let (mut content, root, _a, _b) = tree();
        assert!(content.add_transition(root, Transition::new("bad", NodeId(99))).is_err());
        assert!(content.add_transition(root, Transition::new("ok", NodeId(2))).is_ok());
    }

    #[test]
    fn test_subtree_preorder() {
        let (mut content, root, a, b) = tree();
        let c = content.add_node(Node::basic("C"));
        content.add_child(root, c).unwrap();
        assert_eq!(content.subtree(root), vec![root, a, b, c]);
        assert_eq!(content.tree_root(b), root);
        assert_eq!(content.find_child_by_name(root, "C"), Some(c));
    }

    #[test]
    fn test_register_system_validates_root() {
        let (mut content, root, a, _b) = tree();
        assert!(content.register_system("Quest/Main", root).is_err());
        assert!(content.register_system("Main", a).is_err());
        content.register_system("Main", root).unwrap();
        assert_eq!(content.system_root("Main"), Some(root));
        assert!(content.is_system_root(root));
    }

    #[test]
    fn test_system_nodes_include_dynamic_trees() {
        let (mut content, root, a, b) = tree();
        let cave = content.add_node(Node::basic("Cave"));
        let pool = content.add_node(Node::basic("Pool"));
        let shrine = content.add_node(Node::basic("Shrine"));
        let other = content.add_node(Node::basic("Other"));
        content.add_child(cave, pool).unwrap();
        content.add_transition(b, Transition::new("descend", cave)).unwrap();
        content.add_transition(pool, Transition::new("dive", shrine)).unwrap();
        content.add_transition(a, Transition::new("leave", other)).unwrap();
        content.register_system("Other", other).unwrap();
        content.register_system("Main", root).unwrap();

        assert_eq!(content.system_nodes(root), vec![root, a, b, cave, pool, shrine]);
        assert_eq!(content.node(pool).unwrap().persistent_id, "Main/Cave/Pool");
        assert_eq!(content.node(shrine).unwrap().persistent_id, "Main/Shrine");
    }

    #[test]
    fn test_shared_dynamic_tree_has_one_owner() {
        let mut content = Content::new();
        let alpha = content.add_node(Node::basic("Alpha"));
        let beta = content.add_node(Node::basic("Beta"));
        let cave = content.add_node(Node::basic("Cave"));
        content.add_transition(alpha, Transition::new("enter", cave)).unwrap();
        content.add_transition(beta, Transition::new("enter", cave)).unwrap();
        content.register_system("Alpha", alpha).unwrap();
        content.register_system("Beta", beta).unwrap();

        assert_eq!(content.node(cave).unwrap().persistent_id, "Alpha/Cave");
        assert_eq!(content.system_nodes(alpha), vec![alpha, cave]);
        assert_eq!(content.system_nodes(beta), vec![beta]);
    }
}

//! Converting live content and instances to save records and back.
//!
//! Loading a node tree is two-phase. [`load_nodes`] rebuilds every node into
//! the arena and remembers, for each transition, the persistent id of its
//! target. Once every tree of a document has been rebuilt, and the systems
//! registered, [`resolve_references`] turns those ids into arena indices.
//! Targets outside the tree are looked up through persistent identity; what
//! still cannot be found is left without a target so it can never be taken.

use crate::action::Action;
use crate::condition::Condition;
use crate::content::Content;
use crate::document::{ActionRecord, ConditionRecord, InstanceRecord, Limits, NodeRecord, TransitionRecord};
use crate::error::CoreError;
use crate::identity::Resolution;
use crate::instance::Instance;
use crate::node::{Node, NodeId, Transition};
use crate::registry::VariantRegistry;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Output of the first load phase.
#[derive(Debug)]
pub struct LoadPass {
    pub root: NodeId,
    map: HashMap<String, NodeId>,
    pending: Vec<PendingTarget>,
}

#[derive(Debug)]
struct PendingTarget {
    node: NodeId,
    transition: usize,
    target: String,
}

impl LoadPass {
    pub fn node_count(&self) -> usize {
        self.map.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn condition_record(condition: &Condition) -> ConditionRecord {
    ConditionRecord {
        id: condition.id.clone(),
        name: condition.name.clone(),
        inverted: condition.inverted,
        tag: condition.tag().to_string(),
        params: condition.kind.params(),
    }
}

fn action_record(action: &Action) -> ActionRecord {
    ActionRecord {
        id: action.id.clone(),
        name: action.name.clone(),
        tag: action.tag().to_string(),
        params: action.kind.params(),
    }
}

fn pid_of(content: &Content, id: NodeId) -> Option<String> {
    content.node(id).map(|n| n.persistent_id.clone())
}

/// Writes every node of the system rooted at `root`, root first, with
/// transition targets as persistent ids.
pub fn save_system(content: &Content, root: NodeId) -> Vec<NodeRecord> {
    let ids = content.system_nodes(root);
    let position: HashMap<NodeId, u32> = ids.iter().enumerate().map(|(i, id)| (*id, i as u32)).collect();

    ids.iter()
        .filter_map(|id| content.node(*id))
        .map(|node| NodeRecord {
            id: node.persistent_id.clone(),
            name: node.name.clone(),
            kind: node.kind.clone(),
            parent: node.parent.and_then(|p| position.get(&p).copied()),
            accepting: node.accepting,
            state: node.state.clone(),
            transitions: node
                .transitions
                .iter()
                .map(|t| TransitionRecord {
                    id: t.id.clone(),
                    name: t.name.clone(),
                    target: t.target.and_then(|target| pid_of(content, target)),
                    priority: t.priority,
                    one_shot: t.one_shot,
                    state: t.state.clone(),
                    conditions: t.conditions.iter().map(condition_record).collect(),
                })
                .collect(),
            entry_actions: node.entry_actions.iter().map(action_record).collect(),
            exit_actions: node.exit_actions.iter().map(action_record).collect(),
        })
        .collect()
}

/// Captures an instance's position. Locals and completed transitions go to
/// the document's side table and are not part of the record.
pub fn save_instance(content: &Content, instance: &Instance, embed_nodes: bool) -> InstanceRecord {
    let current = instance.current_node(content);
    InstanceRecord {
        name: instance.name.clone(),
        system: instance.system.clone(),
        has_current_node: current.is_some(),
        current_node_id: current.map(|n| n.persistent_id.clone()).unwrap_or_default(),
        history_ids: instance
            .history
            .iter()
            .filter_map(|id| pid_of(content, *id))
            .collect(),
        node_state: current.map(|n| n.state.clone()).unwrap_or_default(),
        nodes: embed_nodes.then(|| save_system(content, instance.root)),
    }
}

/// First load phase: rebuilds the records into `content`. Transition
/// targets are recorded for [`resolve_references`] and left empty.
pub fn load_nodes(
    content: &mut Content,
    records: &[NodeRecord],
    registry: &VariantRegistry,
    limits: &Limits,
) -> Result<LoadPass, CoreError> {
    limits.check_nodes(records)?;
    if records.is_empty() {
        return Err(CoreError::CorruptData {
            reason: "empty node tree".to_string(),
        });
    }

    let mut ids: Vec<NodeId> = Vec::with_capacity(records.len());
    let mut map = HashMap::with_capacity(records.len());
    let mut pending = Vec::new();

    for record in records {
        let mut node = Node::new(record.name.clone(), record.kind.clone());
        node.persistent_id = record.id.clone();
        node.state = record.state.clone();
        node.accepting = record.accepting;
        node.entry_actions = record.entry_actions.iter().map(|a| build_action(registry, a)).collect();
        node.exit_actions = record.exit_actions.iter().map(|a| build_action(registry, a)).collect();
        node.transitions = record
            .transitions
            .iter()
            .map(|t| Transition {
                id: t.id.clone(),
                name: t.name.clone(),
                target: None,
                conditions: t.conditions.iter().map(|c| build_condition(registry, c)).collect(),
                priority: t.priority,
                state: t.state.clone(),
                one_shot: t.one_shot,
            })
            .collect();

        let id = content.add_node(node);
        if let Some(parent) = record.parent {
            // check_nodes guarantees the parent precedes the child.
            let parent_id = ids[parent as usize];
            content
                .add_child(parent_id, id)
                .map_err(|e| CoreError::CorruptData { reason: e.to_string() })?;
        }

        for (idx, t) in record.transitions.iter().enumerate() {
            if let Some(target) = &t.target {
                pending.push(PendingTarget {
                    node: id,
                    transition: idx,
                    target: target.clone(),
                });
            }
        }

        if map.insert(record.id.clone(), id).is_some() {
            warn!(persistent_id = %record.id, "duplicate persistent id in saved tree; later node wins");
        }
        ids.push(id);
    }

    debug!(nodes = ids.len(), pending = pending.len(), "rebuilt node tree");
    Ok(LoadPass {
        root: ids[0],
        map,
        pending,
    })
}

/// First load phase for a tree that already lives in another arena. Nodes
/// are cloned as-is, so host extension variants survive without a registry
/// round trip.
pub fn copy_nodes(dest: &mut Content, source: &Content, root: NodeId) -> Result<LoadPass, CoreError> {
    let ids = source.system_nodes(root);
    let mut remap: HashMap<NodeId, NodeId> = HashMap::with_capacity(ids.len());
    let mut map = HashMap::with_capacity(ids.len());
    let mut pending = Vec::new();

    for old in &ids {
        let node = source
            .node(*old)
            .ok_or_else(|| CoreError::NodeNotFound { node: old.to_string() })?;
        let mut copy = node.clone();
        let targets: Vec<(usize, String)> = copy
            .transitions
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, t)| {
                t.target
                    .take()
                    .and_then(|target| pid_of(source, target))
                    .map(|pid| (idx, pid))
            })
            .collect();

        let new = dest.add_node(copy);
        pending.extend(targets.into_iter().map(|(transition, target)| PendingTarget {
            node: new,
            transition,
            target,
        }));
        if let Some(parent) = node.parent.and_then(|p| remap.get(&p).copied()) {
            dest.add_child(parent, new)?;
        }
        remap.insert(*old, new);
        map.insert(node.persistent_id.clone(), new);
    }

    let root = remap.get(&root).copied().ok_or_else(|| CoreError::NodeNotFound {
        node: root.to_string(),
    })?;
    Ok(LoadPass { root, map, pending })
}

fn build_condition(registry: &VariantRegistry, record: &ConditionRecord) -> Condition {
    Condition {
        id: record.id.clone(),
        name: record.name.clone(),
        inverted: record.inverted,
        kind: registry.build_condition(&record.tag, &record.params),
    }
}

fn build_action(registry: &VariantRegistry, record: &ActionRecord) -> Action {
    Action {
        id: record.id.clone(),
        name: record.name.clone(),
        kind: registry.build_action(&record.tag, &record.params),
    }
}

/// Second load phase: fills in transition targets. Returns the number of
/// targets that could not be resolved and were left empty.
pub fn resolve_references(content: &mut Content, pass: LoadPass) -> usize {
    resolve_all(content, vec![pass])
}

/// Second load phase for several trees loaded together. A target is looked
/// up in its own tree first, then in the other trees, then in `content`.
pub fn resolve_all(content: &mut Content, passes: Vec<LoadPass>) -> usize {
    let mut shared: HashMap<String, NodeId> = HashMap::new();
    for pass in &passes {
        for (pid, id) in &pass.map {
            shared.entry(pid.clone()).or_insert(*id);
        }
    }

    let mut unresolved = 0;
    for LoadPass { map, pending, .. } in passes {
        for entry in pending {
            let target = match map.get(&entry.target).or_else(|| shared.get(&entry.target)) {
                Some(id) => Some(*id),
                None => content.resolve_strict(&entry.target).node(),
            };
            if target.is_none() {
                warn!(target = %entry.target, node = %entry.node, "transition target not found; transition disabled");
                unresolved += 1;
            }
            if let Some(transition) = content
                .node_mut(entry.node)
                .and_then(|n| n.transitions.get_mut(entry.transition))
            {
                transition.target = target;
            }
        }
    }
    unresolved
}

/// Rebuilds an instance from its record. The current node falls back to the
/// system root when it cannot be resolved; unresolvable history entries are
/// dropped.
pub fn restore_instance(
    content: &mut Content,
    record: &InstanceRecord,
    limits: &Limits,
) -> Result<(Instance, Resolution), CoreError> {
    limits.check_count("history entry", record.history_ids.len(), limits.max_history)?;
    let root = content
        .system_root(&record.system)
        .ok_or_else(|| CoreError::SystemNotFound {
            system: record.system.clone(),
        })?;

    let mut instance = Instance::new(record.name.clone(), record.system.clone(), root);
    let mut resolution = Resolution::Unresolved;
    if record.has_current_node {
        resolution = content.resolve(&record.current_node_id, &record.system);
        instance.current = resolution.node();
    }

    instance.history.reserve(record.history_ids.len());
    for pid in &record.history_ids {
        match content.lookup(pid).node() {
            Some(id) => instance.history.push(id),
            None => warn!(instance = %record.name, persistent_id = %pid, "history entry not found; dropped"),
        }
    }

    Ok((instance, resolution))
}

/// Loads a single record into `content`. An embedded tree is rebuilt and
/// registered only when its system is not already present; otherwise the
/// record is mapped onto the live tree.
pub fn load_instance(
    content: &mut Content,
    record: &InstanceRecord,
    registry: &VariantRegistry,
    limits: &Limits,
) -> Result<(Instance, Resolution), CoreError> {
    if let (Some(nodes), None) = (&record.nodes, content.system_root(&record.system)) {
        let pass = load_nodes(content, nodes, registry, limits)?;
        content.register_system(record.system.clone(), pass.root)?;
        resolve_references(content, pass);
        content.assign_persistent_ids();
    }
    restore_instance(content, record, limits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ConditionKind;
    use crate::context::Scope;
    use crate::node::NodeKind;
    use crate::value::{CompareOp, Value};

    fn world() -> (Content, NodeId) {
        let mut content = Content::new();
        let root = content.add_node(Node::new("WorldSystem", NodeKind::Root));
        let region = content.add_node(Node::new("Vale", NodeKind::Region));
        let town = content.add_node(Node::new("Millbrook", NodeKind::Location).with_state("population", 120));
        let cave = content.add_node(Node::new("Cave", NodeKind::Location));
        content.add_child(root, region).unwrap();
        content.add_child(region, town).unwrap();
        content
            .add_transition(
                root,
                Transition::new("travel", town)
                    .when(Condition::variable(Scope::Global, "day", CompareOp::Ge, 2))
                    .with_priority(3),
            )
            .unwrap();
        content.add_transition(town, Transition::new("explore", cave)).unwrap();
        content.add_transition(cave, Transition::new("leave", region)).unwrap();
        content.register_system("WorldSystem", root).unwrap();
        (content, root)
    }

    #[test]
    fn test_save_system_shape() {
        let (content, root) = world();
        let records = save_system(&content, root);
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["WorldSystem", "WorldSystem/Vale", "WorldSystem/Vale/Millbrook", "WorldSystem/Cave"]
        );
        assert_eq!(records[2].parent, Some(1));
        assert_eq!(records[3].parent, None);
        assert_eq!(records[0].transitions[0].target.as_deref(), Some("WorldSystem/Vale/Millbrook"));
        assert_eq!(records[0].transitions[0].conditions[0].tag, "variable");
    }

    #[test]
    fn test_two_phase_load_into_fresh_arena() {
        let (content, root) = world();
        let records = save_system(&content, root);

        let mut fresh = Content::new();
        fresh.add_node(Node::basic("padding"));
        let pass = load_nodes(&mut fresh, &records, &VariantRegistry::new(), &Limits::default()).unwrap();
        assert_eq!(pass.node_count(), 4);
        assert_eq!(pass.pending_count(), 3);
        let new_root = pass.root;
        fresh.register_system("WorldSystem", new_root).unwrap();
        assert_eq!(resolve_references(&mut fresh, pass), 0);
        fresh.assign_persistent_ids();

        let town = fresh.find_by_pid("WorldSystem/Vale/Millbrook").unwrap();
        assert_ne!(Some(town), content.find_by_pid("WorldSystem/Vale/Millbrook"));
        let travel = &fresh.node(new_root).unwrap().transitions[0];
        assert_eq!(travel.target, Some(town));
        assert_eq!(travel.priority, 3);
        assert_eq!(fresh.node(town).unwrap().state.get("population"), Some(&Value::Int(120)));

        let cave = fresh.find_by_pid("WorldSystem/Cave").unwrap();
        assert_eq!(
            fresh.node(cave).unwrap().transitions[0].target,
            fresh.find_by_pid("WorldSystem/Vale")
        );
    }

    #[test]
    fn test_unknown_condition_tag_loads_as_false() {
        let (content, root) = world();
        let mut records = save_system(&content, root);
        records[0].transitions[0].conditions[0].tag = "moon_phase".into();

        let mut fresh = Content::new();
        let pass = load_nodes(&mut fresh, &records, &VariantRegistry::new(), &Limits::default()).unwrap();
        let new_root = pass.root;
        resolve_references(&mut fresh, pass);
        let cond = &fresh.node(new_root).unwrap().transitions[0].conditions[0];
        assert!(matches!(cond.kind, ConditionKind::Unknown { .. }));
        assert!(!cond.evaluate(&crate::context::Context::new("")));
    }

    #[test]
    fn test_unresolved_target_left_empty() {
        let (content, root) = world();
        let mut records = save_system(&content, root);
        records[3].transitions[0].target = Some("Elsewhere/Nothing".into());

        let mut fresh = Content::new();
        let pass = load_nodes(&mut fresh, &records, &VariantRegistry::new(), &Limits::default()).unwrap();
        let new_root = pass.root;
        fresh.register_system("WorldSystem", new_root).unwrap();
        assert_eq!(resolve_references(&mut fresh, pass), 1);
        let cave = fresh.nodes().find(|n| n.name == "Cave").unwrap();
        assert_eq!(cave.transitions[0].target, None);
    }

    #[test]
    fn test_corrupt_tree_rejected() {
        let (content, root) = world();
        let mut records = save_system(&content, root);
        records[1].parent = Some(5);
        let mut fresh = Content::new();
        let err = load_nodes(&mut fresh, &records, &VariantRegistry::new(), &Limits::default()).unwrap_err();
        assert!(err.is_corruption());
        assert!(load_nodes(&mut fresh, &[], &VariantRegistry::new(), &Limits::default()).is_err());
    }

    #[test]
    fn test_copy_nodes_keeps_structure() {
        let (content, root) = world();
        let mut dest = Content::new();
        dest.add_node(Node::basic("padding"));
        let pass = copy_nodes(&mut dest, &content, root).unwrap();
        let new_root = pass.root;
        dest.register_system("WorldSystem", new_root).unwrap();
        assert_eq!(resolve_references(&mut dest, pass), 0);
        dest.assign_persistent_ids();
        assert_eq!(save_system(&dest, new_root), save_system(&content, root));
    }

    #[test]
    fn test_restore_instance_falls_back_to_root() {
        let (mut content, root) = world();
        let town = content.find_by_pid("WorldSystem/Vale/Millbrook").unwrap();
        let mut inst = Instance::new("player", "WorldSystem", root);
        inst.current = Some(town);
        inst.history = vec![root];
        let mut record = save_instance(&content, &inst, false);
        assert!(record.nodes.is_none());

        let (restored, resolution) = restore_instance(&mut content, &record, &Limits::default()).unwrap();
        assert_eq!(resolution, Resolution::Exact(town));
        assert_eq!(restored.current, Some(town));
        assert_eq!(restored.history, vec![root]);

        record.current_node_id = "Gone/Nowhere".into();
        record.history_ids.push("Gone/Else".into());
        let (restored, resolution) = restore_instance(&mut content, &record, &Limits::default()).unwrap();
        assert_eq!(resolution, Resolution::Fallback(root));
        assert_eq!(restored.current, Some(root));
        assert_eq!(restored.history, vec![root]);
    }

    #[test]
    fn test_restore_instance_leaves_node_state_alone() {
        let (mut content, root) = world();
        let town = content.find_by_pid("WorldSystem/Vale/Millbrook").unwrap();
        let mut inst = Instance::new("player", "WorldSystem", root);
        inst.current = Some(town);
        let mut record = save_instance(&content, &inst, false);
        assert_eq!(record.node_state.get("population"), Some(&Value::Int(120)));

        record.node_state.insert("population".into(), Value::Int(5));
        record.node_state.insert("burned".into(), Value::Bool(true));
        let (restored, _) = restore_instance(&mut content, &record, &Limits::default()).unwrap();
        assert_eq!(restored.current, Some(town));
        let state = &content.node(town).unwrap().state;
        assert_eq!(state.get("population"), Some(&Value::Int(120)));
        assert!(state.get("burned").is_none());
    }

    #[test]
    fn test_history_entries_do_not_rename_nodes() {
        let (mut content, root) = world();
        let town = content.find_by_pid("WorldSystem/Vale/Millbrook").unwrap();
        let record = InstanceRecord {
            name: "player".into(),
            system: "WorldSystem".into(),
            history_ids: vec!["WorldSystem/OldVale/Millbrook".into()],
            ..Default::default()
        };

        let (restored, _) = restore_instance(&mut content, &record, &Limits::default()).unwrap();
        assert_eq!(restored.history, vec![town]);
        assert_eq!(restored.root, root);
        assert_eq!(content.node(town).unwrap().persistent_id, "WorldSystem/Vale/Millbrook");
        assert_eq!(content.find_by_pid("WorldSystem/Vale/Millbrook"), Some(town));
        assert!(content.find_by_pid("WorldSystem/OldVale/Millbrook").is_none());
    }

    #[test]
    fn test_resolve_all_links_targets_across_trees() {
        let mut content = Content::new();
        let alpha = content.add_node(Node::basic("Alpha"));
        let beta = content.add_node(Node::basic("Beta"));
        let cave = content.add_node(Node::basic("Cave"));
        content.add_transition(alpha, Transition::new("enter", cave)).unwrap();
        content.add_transition(beta, Transition::new("enter", cave)).unwrap();
        content.register_system("Alpha", alpha).unwrap();
        content.register_system("Beta", beta).unwrap();
        let alpha_records = save_system(&content, alpha);
        let beta_records = save_system(&content, beta);
        assert_eq!(beta_records.len(), 1);
        assert_eq!(beta_records[0].transitions[0].target.as_deref(), Some("Alpha/Cave"));

        let mut fresh = Content::new();
        let registry = VariantRegistry::new();
        let limits = Limits::default();
        let a = load_nodes(&mut fresh, &alpha_records, &registry, &limits).unwrap();
        let b = load_nodes(&mut fresh, &beta_records, &registry, &limits).unwrap();
        let (new_alpha, new_beta) = (a.root, b.root);
        fresh.register_system("Alpha", new_alpha).unwrap();
        fresh.register_system("Beta", new_beta).unwrap();
        assert_eq!(resolve_all(&mut fresh, vec![a, b]), 0);
        fresh.assign_persistent_ids();

        assert_eq!(fresh.len(), 3);
        let new_cave = fresh.find_by_pid("Alpha/Cave").unwrap();
        assert_eq!(fresh.node(new_alpha).unwrap().transitions[0].target, Some(new_cave));
        assert_eq!(fresh.node(new_beta).unwrap().transitions[0].target, Some(new_cave));
    }

    #[test]
    fn test_load_instance_rebuilds_missing_system() {
        let (content, root) = world();
        let town = content.find_by_pid("WorldSystem/Vale/Millbrook").unwrap();
        let mut inst = Instance::new("player", "WorldSystem", root);
        inst.current = Some(town);
        let record = save_instance(&content, &inst, true);

        let mut fresh = Content::new();
        fresh.add_node(Node::basic("padding"));
        let (restored, resolution) =
            load_instance(&mut fresh, &record, &VariantRegistry::new(), &Limits::default()).unwrap();
        let fresh_town = fresh.find_by_pid("WorldSystem/Vale/Millbrook").unwrap();
        assert_eq!(resolution, Resolution::Exact(fresh_town));
        assert_eq!(restored.current, Some(fresh_town));
        assert_eq!(restored.root, fresh.system_root("WorldSystem").unwrap());

        // A second record for the same system maps onto the tree already loaded.
        let before = fresh.len();
        load_instance(&mut fresh, &record, &VariantRegistry::new(), &Limits::default()).unwrap();
        assert_eq!(fresh.len(), before);
    }
}

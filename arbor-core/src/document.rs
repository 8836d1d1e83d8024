//! Save document shape and load-time bounds.
//!
//! A node tree is stored as a flat list in depth-first order: each record
//! names its parent by index into the same list, and the parent always comes
//! first. The first record is the system root; later records without a
//! parent are roots of transition-only trees. Keeping the list flat means a
//! deep tree never turns into deeply nested JSON.

use crate::error::CoreError;
use crate::node::NodeKind;
use crate::value::{StateBag, Value, VarTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveDocument {
    pub version: u32,
    pub instances: Vec<InstanceRecord>,
    #[serde(default)]
    pub side: SideTable,
}

impl Default for SaveDocument {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            instances: Vec::new(),
            side: SideTable::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    pub system: String,
    pub has_current_node: bool,
    #[serde(default)]
    pub current_node_id: String,
    #[serde(default)]
    pub history_ids: Vec<String>,
    /// State bag of the current node at save time. Written for inspection;
    /// loading never applies it, as node state is shared by every instance.
    #[serde(default)]
    pub node_state: StateBag,
    /// Node tree of the instance's system. Written once per system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<NodeRecord>>,
}

/// Variable tables kept apart from the instance records so the slot codec
/// can store them in binary form.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SideTable {
    #[serde(default)]
    pub globals: VarTable,
    #[serde(default)]
    pub locals: BTreeMap<String, VarTable>,
    #[serde(default)]
    pub completed: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Persistent id.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<u32>,
    #[serde(default)]
    pub accepting: bool,
    #[serde(default)]
    pub state: StateBag,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
    #[serde(default)]
    pub entry_actions: Vec<ActionRecord>,
    #[serde(default)]
    pub exit_actions: Vec<ActionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: String,
    pub name: String,
    /// Persistent id of the target node.
    pub target: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub one_shot: bool,
    #[serde(default)]
    pub state: StateBag,
    #[serde(default)]
    pub conditions: Vec<ConditionRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub inverted: bool,
    #[serde(rename = "type")]
    pub tag: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub tag: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Upper bounds applied to untrusted documents before anything is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_instances: usize,
    pub max_nodes: usize,
    pub max_depth: usize,
    pub max_transitions: usize,
    pub max_list_len: usize,
    pub max_state_entries: usize,
    pub max_key_len: usize,
    pub max_string_len: usize,
    pub max_history: usize,
    /// Encoded size of one condition's or action's params.
    pub max_param_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_instances: 10_000,
            max_nodes: 65_536,
            max_depth: 256,
            max_transitions: 4_096,
            max_list_len: 4_096,
            max_state_entries: 1_000,
            max_key_len: 1_000,
            max_string_len: 10_000,
            max_history: 100_000,
            max_param_bytes: 16_384,
        }
    }
}

fn corrupt(reason: String) -> CoreError {
    CoreError::CorruptData { reason }
}

fn charge(budget: &mut usize, n: usize) -> bool {
    match budget.checked_sub(n) {
        Some(left) => {
            *budget = left;
            true
        }
        None => false,
    }
}

/// Charges the JSON text size of `value` against `budget`, stopping as soon
/// as it runs out. Returns false when the value does not fit.
fn fits_json(value: &serde_json::Value, budget: &mut usize) -> bool {
    match value {
        serde_json::Value::Null => charge(budget, 4),
        serde_json::Value::Bool(b) => charge(budget, if *b { 4 } else { 5 }),
        serde_json::Value::Number(n) => charge(budget, n.to_string().len()),
        serde_json::Value::String(s) => charge(budget, s.len() + 2),
        serde_json::Value::Array(items) => {
            charge(budget, items.len() + 1) && items.iter().all(|item| fits_json(item, budget))
        }
        serde_json::Value::Object(map) => {
            charge(budget, 2 * map.len() + 1)
                && map
                    .iter()
                    .all(|(key, item)| charge(budget, key.len() + 2) && fits_json(item, budget))
        }
    }
}

impl Limits {
    pub fn check_count(&self, what: &str, count: usize, max: usize) -> Result<(), CoreError> {
        if count > max {
            return Err(corrupt(format!("{} count {} exceeds limit {}", what, count, max)));
        }
        Ok(())
    }

    pub fn check_key(&self, key: &str) -> Result<(), CoreError> {
        if key.len() > self.max_key_len {
            return Err(corrupt(format!(
                "key of {} bytes exceeds limit {}",
                key.len(),
                self.max_key_len
            )));
        }
        Ok(())
    }

    pub fn check_string(&self, s: &str) -> Result<(), CoreError> {
        if s.len() > self.max_string_len {
            return Err(corrupt(format!(
                "string of {} bytes exceeds limit {}",
                s.len(),
                self.max_string_len
            )));
        }
        Ok(())
    }

    pub fn check_table(&self, table: &VarTable) -> Result<(), CoreError> {
        self.check_count("state entry", table.len(), self.max_state_entries)?;
        for (key, value) in table {
            self.check_key(key)?;
            if let Value::Str(s) = value {
                self.check_string(s)?;
            }
        }
        Ok(())
    }

    pub fn check_params(&self, what: &str, params: &serde_json::Value) -> Result<(), CoreError> {
        let mut budget = self.max_param_bytes;
        if !fits_json(params, &mut budget) {
            return Err(corrupt(format!(
                "{} params exceed limit of {} bytes",
                what, self.max_param_bytes
            )));
        }
        Ok(())
    }

    /// Validates a flat node list: sizes, parent ordering, depth and the
    /// size of every condition's and action's params.
    pub fn check_nodes(&self, records: &[NodeRecord]) -> Result<(), CoreError> {
        self.check_count("node", records.len(), self.max_nodes)?;
        let mut depth = vec![0usize; records.len()];

        for (i, record) in records.iter().enumerate() {
            self.check_key(&record.id)?;
            self.check_key(&record.name)?;
            self.check_table(&record.state)?;
            self.check_count("transition", record.transitions.len(), self.max_transitions)?;
            self.check_count("entry action", record.entry_actions.len(), self.max_list_len)?;
            self.check_count("exit action", record.exit_actions.len(), self.max_list_len)?;
            for action in record.entry_actions.iter().chain(&record.exit_actions) {
                self.check_key(&action.id)?;
                self.check_params("action", &action.params)?;
            }

            match record.parent {
                None => {}
                Some(_) if i == 0 => {
                    return Err(corrupt("first node record must be the system root".to_string()))
                }
                Some(p) => {
                    let p = p as usize;
                    if p >= i {
                        return Err(corrupt(format!(
                            "node record {} names parent {} which does not precede it",
                            i, p
                        )));
                    }
                    depth[i] = depth[p] + 1;
                    if depth[i] > self.max_depth {
                        return Err(corrupt(format!(
                            "node tree deeper than limit {}",
                            self.max_depth
                        )));
                    }
                }
            }

            for transition in &record.transitions {
                self.check_key(&transition.id)?;
                self.check_table(&transition.state)?;
                self.check_count("condition", transition.conditions.len(), self.max_list_len)?;
                for condition in &transition.conditions {
                    self.check_key(&condition.id)?;
                    self.check_params("condition", &condition.params)?;
                }
                if let Some(target) = &transition.target {
                    self.check_key(target)?;
                }
            }
        }
        Ok(())
    }

    pub fn check_document(&self, doc: &SaveDocument) -> Result<(), CoreError> {
        if doc.version > DOCUMENT_VERSION {
            return Err(corrupt(format!(
                "document version {} is newer than supported version {}",
                doc.version, DOCUMENT_VERSION
            )));
        }
        self.check_count("instance", doc.instances.len(), self.max_instances)?;
        for record in &doc.instances {
            self.check_key(&record.name)?;
            self.check_key(&record.system)?;
            self.check_key(&record.current_node_id)?;
            self.check_count("history entry", record.history_ids.len(), self.max_history)?;
            self.check_table(&record.node_state)?;
            if let Some(nodes) = &record.nodes {
                self.check_nodes(nodes)?;
            }
        }

        self.check_table(&doc.side.globals)?;
        self.check_count("local table", doc.side.locals.len(), self.max_instances)?;
        for (name, table) in &doc.side.locals {
            self.check_key(name)?;
            self.check_table(table)?;
        }
        for (name, ids) in &doc.side.completed {
            self.check_key(name)?;
            self.check_count("completed transition", ids.len(), self.max_history)?;
        }
        Ok(())
    }
}

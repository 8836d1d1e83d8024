//! A single running automaton.

use crate::content::Content;
use crate::context::Context;
use crate::error::CoreError;
use crate::node::{Node, NodeId};
use crate::value::VarTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// One automaton over a system's content: a current-node pointer plus the
/// per-instance data that survives a save.
#[derive(Debug, Clone)]
pub struct Instance {
    pub name: String,
    pub system: String,
    pub root: NodeId,
    /// `None` until the first input initializes the instance.
    pub current: Option<NodeId>,
    /// Nodes left, oldest first.
    pub history: Vec<NodeId>,
    pub locals: VarTable,
    /// Ids of one-shot transitions this instance has taken.
    pub completed: BTreeSet<String>,
}

/// Result of a taken transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub from: NodeId,
    pub to: NodeId,
    pub transition_id: String,
    pub transition_name: String,
    /// True when the quest auto-complete rule chose the transition.
    pub via_fallback: bool,
    pub failed_actions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Available,
    Locked,
    Completed,
}

/// A transition out of the current node as presented to the player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInfo {
    pub id: String,
    pub name: String,
    pub target_id: Option<String>,
    pub target_name: Option<String>,
    pub description: String,
    pub status: ActionStatus,
}

struct Chosen {
    id: String,
    name: String,
    target: NodeId,
    one_shot: bool,
    via_fallback: bool,
}

impl Instance {
    pub fn new(name: impl Into<String>, system: impl Into<String>, root: NodeId) -> Self {
        Self {
            name: name.into(),
            system: system.into(),
            root,
            current: None,
            history: Vec::new(),
            locals: VarTable::new(),
            completed: BTreeSet::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_node<'a>(&self, content: &'a Content) -> Option<&'a Node> {
        self.current.and_then(|id| content.node(id))
    }

    /// Points the instance at its root and runs the root's entry actions.
    pub fn initialize(&mut self, content: &Content, ctx: &mut Context) -> Result<(), CoreError> {
        let root = content.node(self.root).ok_or_else(|| CoreError::NodeNotFound {
            node: self.root.to_string(),
        })?;
        self.current = Some(self.root);
        root.enter(ctx);
        debug!(instance = %self.name, node = %root.name, "initialized");
        Ok(())
    }

    /// Evaluates the current node against `ctx` and takes the winning
    /// transition, if any.
    pub fn process(&mut self, content: &Content, ctx: &mut Context) -> Result<Option<Step>, CoreError> {
        let node = self.require_current(content)?;

        let chosen = match node.evaluate_transition(ctx, &self.completed) {
            Some(t) => t.target.map(|target| Chosen {
                id: t.id.clone(),
                name: t.name.clone(),
                target,
                one_shot: t.one_shot,
                via_fallback: false,
            }),
            None => self.quest_fallback(content, node, ctx),
        };

        let Some(chosen) = chosen else {
            ctx.trace(&format!("node '{}': no transition taken", node.name));
            return Ok(None);
        };

        let from = node.id;
        let failed_actions = self.take(content, ctx, chosen.target, &chosen.id, chosen.one_shot)?;
        Ok(Some(Step {
            from,
            to: chosen.target,
            transition_id: chosen.id,
            transition_name: chosen.name,
            via_fallback: chosen.via_fallback,
            failed_actions,
        }))
    }

    /// A quest whose objectives are all complete advances along its first
    /// transition into an accepting node, ignoring that transition's guard.
    fn quest_fallback(&self, content: &Content, node: &Node, ctx: &Context) -> Option<Chosen> {
        if !node.objectives_complete(ctx) {
            return None;
        }
        let transition = node.ordered_transitions().into_iter().find(|t| {
            !(t.one_shot && self.completed.contains(&t.id))
                && t.target
                    .and_then(|target| content.node(target))
                    .map(|n| n.accepting)
                    .unwrap_or(false)
        })?;
        ctx.trace(&format!(
            "quest '{}' objectives complete; auto-advancing via '{}'",
            node.name, transition.name
        ));
        Some(Chosen {
            id: transition.id.clone(),
            name: transition.name.clone(),
            target: transition.target?,
            one_shot: transition.one_shot,
            via_fallback: true,
        })
    }

    /// Moves to `target` regardless of guards.
    pub fn force_transition(
        &mut self,
        content: &Content,
        ctx: &mut Context,
        target: NodeId,
    ) -> Result<Step, CoreError> {
        if content.node(target).is_none() {
            return Err(CoreError::NodeNotFound {
                node: target.to_string(),
            });
        }
        let from = self.current.unwrap_or(self.root);
        let failed_actions = match self.current {
            Some(_) => self.take(content, ctx, target, "", false)?,
            None => {
                self.current = Some(target);
                content.node(target).map(|n| n.enter(ctx)).unwrap_or(0)
            }
        };
        Ok(Step {
            from,
            to: target,
            transition_id: String::new(),
            transition_name: "forced".to_string(),
            via_fallback: false,
            failed_actions,
        })
    }

    /// Clears history and re-enters the root. Locals and taken one-shot
    /// transitions are kept.
    pub fn reset(&mut self, content: &Content, ctx: &mut Context) -> Result<(), CoreError> {
        self.history.clear();
        self.initialize(content, ctx)
    }

    /// Lists transitions out of the current node with their status.
    pub fn available_actions(&self, content: &Content, ctx: &Context) -> Vec<ActionInfo> {
        let Some(node) = self.current_node(content) else {
            return Vec::new();
        };
        node.ordered_transitions()
            .into_iter()
            .map(|t| {
                let target = t.target.and_then(|id| content.node(id));
                let status = if t.one_shot && self.completed.contains(&t.id) {
                    ActionStatus::Completed
                } else if target.is_some() && t.is_available(ctx) {
                    ActionStatus::Available
                } else {
                    ActionStatus::Locked
                };
                ActionInfo {
                    id: t.id.clone(),
                    name: t.name.clone(),
                    target_id: target.map(|n| n.persistent_id.clone()),
                    target_name: target.map(|n| n.name.clone()),
                    description: t.describe(),
                    status,
                }
            })
            .collect()
    }

    fn require_current<'a>(&self, content: &'a Content) -> Result<&'a Node, CoreError> {
        let id = self.current.ok_or_else(|| CoreError::NotInitialized {
            instance: self.name.clone(),
        })?;
        content.node(id).ok_or_else(|| CoreError::NodeNotFound { node: id.to_string() })
    }

    /// Exit current, record history, swap, enter target.
    fn take(
        &mut self,
        content: &Content,
        ctx: &mut Context,
        target: NodeId,
        transition_id: &str,
        one_shot: bool,
    ) -> Result<usize, CoreError> {
        let from = self.require_current(content)?;
        let to = content.node(target).ok_or_else(|| CoreError::NodeNotFound {
            node: target.to_string(),
        })?;

        let mut failed = from.exit(ctx);
        self.history.push(from.id);
        self.current = Some(target);
        if one_shot && !transition_id.is_empty() {
            self.completed.insert(transition_id.to_string());
        }
        failed += to.enter(ctx);

        debug!(instance = %self.name, from = %from.name, to = %to.name, "transition");
        Ok(failed)
    }
}

//! Nodes, transitions and transition evaluation.

use crate::action::Action;
use crate::condition::{Condition, ConditionKind};
use crate::context::{objective_key, Context};
use crate::value::{StateBag, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

/// Index of a node in the content arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Domain role of a node. Behaviour differences are expressed through the
/// capability queries below rather than by matching on the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Basic,
    Root,
    Quest {
        objectives: Vec<String>,
    },
    Dialogue,
    Skill,
    Region,
    Location,
    Crafting,
    Custom(String),
}

impl NodeKind {
    pub fn tag(&self) -> &str {
        match self {
            NodeKind::Basic => "basic",
            NodeKind::Root => "root",
            NodeKind::Quest { .. } => "quest",
            NodeKind::Dialogue => "dialogue",
            NodeKind::Skill => "skill",
            NodeKind::Region => "region",
            NodeKind::Location => "location",
            NodeKind::Crafting => "crafting",
            NodeKind::Custom(tag) => tag,
        }
    }

    pub fn is_quest(&self) -> bool {
        matches!(self, NodeKind::Quest { .. })
    }

    pub fn objectives(&self) -> &[String] {
        match self {
            NodeKind::Quest { objectives } => objectives,
            _ => &[],
        }
    }

    /// Region and location nodes are the only ones a world map addresses.
    pub fn is_location(&self) -> bool {
        matches!(self, NodeKind::Region | NodeKind::Location)
    }

    pub fn is_dialogue(&self) -> bool {
        matches!(self, NodeKind::Dialogue)
    }
}

/// A guarded edge to another node.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Stable id. Left empty at authoring time, it is filled in as
    /// `<node persistent id>#<index>` when persistent ids are assigned.
    pub id: String,
    pub name: String,
    pub target: Option<NodeId>,
    pub conditions: Vec<Condition>,
    pub priority: i32,
    pub state: StateBag,
    /// Once taken by an instance, never taken again by that instance.
    pub one_shot: bool,
}

impl Transition {
    pub fn new(name: impl Into<String>, target: NodeId) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            target: Some(target),
            conditions: Vec::new(),
            priority: 0,
            state: StateBag::new(),
            one_shot: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_state(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.state.insert(key.into(), value.into());
        self
    }

    pub fn once(mut self) -> Self {
        self.one_shot = true;
        self
    }

    /// Conjunction of all conditions, left to right with short circuit.
    /// An unconditioned transition is always satisfied.
    pub fn is_satisfied(&self, ctx: &Context) -> bool {
        self.conditions.iter().all(|c| c.evaluate(ctx))
    }

    /// Whether the transition reacts to explicit player input rather than
    /// firing on its own.
    pub fn is_player_choice(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| matches!(c.kind, ConditionKind::InputMatch { .. }))
    }

    /// Whether a player could take this transition now: every condition
    /// holds except plain input matches, which the choice itself supplies.
    pub fn is_available(&self, ctx: &Context) -> bool {
        self.conditions.iter().all(|c| {
            (!c.inverted && matches!(c.kind, ConditionKind::InputMatch { .. })) || c.evaluate(ctx)
        })
    }

    pub fn describe(&self) -> String {
        if self.conditions.is_empty() {
            return "always".to_string();
        }
        self.conditions
            .iter()
            .map(Condition::describe)
            .collect::<Vec<_>>()
            .join(" and ")
    }
}

/// One state of an automaton.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub persistent_id: String,
    pub state: StateBag,
    pub transitions: Vec<Transition>,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
    pub entry_actions: Vec<Action>,
    pub exit_actions: Vec<Action>,
    pub accepting: bool,
}

impl Node {
    /// Creates a detached node. The id is assigned when it is added to content.
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: NodeId(0),
            name: name.into(),
            kind,
            persistent_id: String::new(),
            state: StateBag::new(),
            transitions: Vec::new(),
            children: Vec::new(),
            parent: None,
            entry_actions: Vec::new(),
            exit_actions: Vec::new(),
            accepting: false,
        }
    }

    pub fn basic(name: impl Into<String>) -> Self {
        Self::new(name, NodeKind::Basic)
    }

    pub fn with_state(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.state.insert(key.into(), value.into());
        self
    }

    pub fn on_enter(mut self, action: Action) -> Self {
        self.entry_actions.push(action);
        self
    }

    pub fn on_exit(mut self, action: Action) -> Self {
        self.exit_actions.push(action);
        self
    }

    pub fn accepting(mut self) -> Self {
        self.accepting = true;
        self
    }

    /// Transitions in evaluation order: descending priority, declaration
    /// order among equal priorities.
    pub fn ordered_transitions(&self) -> Vec<&Transition> {
        let mut ordered: Vec<&Transition> = self.transitions.iter().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
        ordered
    }

    /// Returns the highest-priority satisfied transition. Transitions with
    /// no target, and one-shot transitions in `completed`, are skipped.
    pub fn evaluate_transition(&self, ctx: &Context, completed: &BTreeSet<String>) -> Option<&Transition> {
        self.ordered_transitions().into_iter().find(|t| {
            if t.target.is_none() || (t.one_shot && completed.contains(&t.id)) {
                return false;
            }
            let satisfied = t.is_satisfied(ctx);
            ctx.trace(&format!(
                "node '{}' transition '{}' (priority {}): {}",
                self.name, t.name, t.priority, satisfied
            ));
            satisfied
        })
    }

    /// True when this is a quest node and every listed objective is flagged
    /// complete in the context.
    pub fn objectives_complete(&self, ctx: &Context) -> bool {
        let objectives = self.kind.objectives();
        self.kind.is_quest()
            && objectives.iter().all(|o| {
                ctx.get_var(&objective_key(&self.name, o))
                    .map(Value::is_truthy)
                    .unwrap_or(false)
            })
    }

    /// Transitions a player picks explicitly.
    pub fn player_choices(&self) -> Vec<&Transition> {
        self.ordered_transitions()
            .into_iter()
            .filter(|t| t.is_player_choice())
            .collect()
    }

    pub fn enter(&self, ctx: &mut Context) -> usize {
        run_actions(&self.name, "entry", &self.entry_actions, ctx)
    }

    pub fn exit(&self, ctx: &mut Context) -> usize {
        run_actions(&self.name, "exit", &self.exit_actions, ctx)
    }
}

/// Runs actions in order; a failure is logged and the rest still run.
/// Returns the number of failed actions.
fn run_actions(node: &str, phase: &str, actions: &[Action], ctx: &mut Context) -> usize {
    let mut failed = 0;
    for action in actions {
        ctx.trace(&format!("node '{}' {} action '{}'", node, phase, action.name));
        if let Err(e) = action.execute(ctx) {
            warn!(node, phase, action = %action.name, error = %e, "action failed");
            failed += 1;
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Scope;
    use crate::value::CompareOp;

    fn node_with(transitions: Vec<Transition>) -> Node {
        let mut node = Node::basic("A");
        node.transitions = transitions;
        node
    }

    #[test]
    fn test_priority_beats_declaration_order() {
        let node = node_with(vec![
            Transition::new("to_b", NodeId(1)).when(Condition::input("go")).with_priority(1),
            Transition::new("to_c", NodeId(2))
                .when(Condition::boolean(true))
                .with_priority(2),
        ]);
        let chosen = node.evaluate_transition(&Context::new("go"), &BTreeSet::new()).unwrap();
        assert_eq!(chosen.target, Some(NodeId(2)));
    }

    #[test]
    fn test_ties_preserve_declaration_order() {
        let node = node_with(vec![
            Transition::new("first", NodeId(1)),
            Transition::new("second", NodeId(2)),
        ]);
        let chosen = node.evaluate_transition(&Context::new(""), &BTreeSet::new()).unwrap();
        assert_eq!(chosen.name, "first");
    }

    #[test]
    fn test_null_target_never_returned() {
        let mut dangling = Transition::new("dangling", NodeId(1)).with_priority(10);
        dangling.target = None;
        let node = node_with(vec![dangling, Transition::new("fallback", NodeId(2))]);
        let chosen = node.evaluate_transition(&Context::new(""), &BTreeSet::new()).unwrap();
        assert_eq!(chosen.name, "fallback");
    }

    #[test]
    fn test_completed_one_shot_skipped() {
        let node = node_with(vec![
            Transition::new("bonus", NodeId(1)).with_id("A#0").once().with_priority(5),
            Transition::new("normal", NodeId(2)).with_id("A#1"),
        ]);
        let mut completed = BTreeSet::new();
        let ctx = Context::new("");
        assert_eq!(node.evaluate_transition(&ctx, &completed).unwrap().name, "bonus");
        completed.insert("A#0".to_string());
        assert_eq!(node.evaluate_transition(&ctx, &completed).unwrap().name, "normal");
    }

    #[test]
    fn test_no_match() {
        let node = node_with(vec![Transition::new("locked", NodeId(1))
            .when(Condition::variable(Scope::Global, "key", CompareOp::Eq, true))]);
        assert!(node.evaluate_transition(&Context::new(""), &BTreeSet::new()).is_none());
    }

    #[test]
    fn test_failed_action_does_not_stop_the_rest() {
        let node = Node::basic("A")
            .on_enter(Action::set_variable(Scope::Param, "x", 1))
            .on_enter(Action::set_variable(Scope::Local, "entered", true));
        let mut ctx = Context::new("");
        assert_eq!(node.enter(&mut ctx), 1);
        assert_eq!(ctx.lookup(Scope::Local, "entered"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_quest_objectives() {
        let node = Node::new(
            "wolves",
            NodeKind::Quest {
                objectives: vec!["kill".into(), "report".into()],
            },
        );
        let mut ctx = Context::new("");
        ctx.set(Scope::Global, objective_key("wolves", "kill"), Value::Bool(true));
        assert!(!node.objectives_complete(&ctx));
        ctx.set(Scope::Global, objective_key("wolves", "report"), Value::Bool(true));
        assert!(node.objectives_complete(&ctx));
        assert!(!Node::basic("wolves").objectives_complete(&ctx));
    }

    #[test]
    fn test_node_kind_serde() {
        let kind = NodeKind::Quest {
            objectives: vec!["kill".into()],
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "quest", "data": {"objectives": ["kill"]}}));
        let custom: NodeKind = serde_json::from_value(serde_json::json!({"kind": "custom", "data": "weather"})).unwrap();
        assert_eq!(custom, NodeKind::Custom("weather".into()));
        assert_eq!(custom.tag(), "weather");
    }
}

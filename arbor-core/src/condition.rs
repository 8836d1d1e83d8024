//! Transition guard predicates.

use crate::context::{objective_key, quest_status_key, relationship_key, Context, Scope};
use crate::guard::GuardExpr;
use crate::value::{CompareOp, Value};
use crate::CoreError;
use serde_json::json;
use std::fmt;
use std::sync::Arc;

pub const TAG_BOOLEAN: &str = "boolean";
pub const TAG_VARIABLE: &str = "variable";
pub const TAG_INPUT: &str = "input";
pub const TAG_EXPRESSION: &str = "expression";
pub const TAG_OBJECTIVE_COMPLETE: &str = "objective_complete";
pub const TAG_RELATIONSHIP: &str = "relationship";
pub const TAG_QUEST_STATUS: &str = "quest_status";

/// Host-provided condition behaviour, registered under its own tag.
pub trait ConditionExtension: fmt::Debug + Send + Sync {
    fn tag(&self) -> &str;

    fn evaluate(&self, ctx: &Context) -> bool;

    fn describe(&self) -> String {
        self.tag().to_string()
    }

    /// Parameters written to save files; fed back to the registered factory on load.
    fn params(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

#[derive(Debug, Clone)]
pub enum ConditionKind {
    Boolean(bool),
    VariableCompare {
        name: String,
        scope: Scope,
        op: CompareOp,
        value: Value,
    },
    InputMatch {
        input: String,
    },
    Expression {
        source: String,
        expr: GuardExpr,
    },
    ObjectiveComplete {
        quest: String,
        objective: String,
    },
    RelationshipThreshold {
        npc: String,
        op: CompareOp,
        level: Value,
    },
    QuestStatus {
        quest: String,
        status: String,
    },
    Extension(Arc<dyn ConditionExtension>),
    /// Produced on load for a tag nobody registered. Never satisfied.
    Unknown {
        tag: String,
        params: serde_json::Value,
    },
}

impl ConditionKind {
    pub fn tag(&self) -> &str {
        match self {
            ConditionKind::Boolean(_) => TAG_BOOLEAN,
            ConditionKind::VariableCompare { .. } => TAG_VARIABLE,
            ConditionKind::InputMatch { .. } => TAG_INPUT,
            ConditionKind::Expression { .. } => TAG_EXPRESSION,
            ConditionKind::ObjectiveComplete { .. } => TAG_OBJECTIVE_COMPLETE,
            ConditionKind::RelationshipThreshold { .. } => TAG_RELATIONSHIP,
            ConditionKind::QuestStatus { .. } => TAG_QUEST_STATUS,
            ConditionKind::Extension(ext) => ext.tag(),
            ConditionKind::Unknown { tag, .. } => tag,
        }
    }

    pub fn params(&self) -> serde_json::Value {
        match self {
            ConditionKind::Boolean(value) => json!({ "value": value }),
            ConditionKind::VariableCompare {
                name,
                scope,
                op,
                value,
            } => json!({ "name": name, "scope": scope, "op": op, "value": value }),
            ConditionKind::InputMatch { input } => json!({ "input": input }),
            ConditionKind::Expression { source, .. } => json!({ "expr": source }),
            ConditionKind::ObjectiveComplete { quest, objective } => {
                json!({ "quest": quest, "objective": objective })
            }
            ConditionKind::RelationshipThreshold { npc, op, level } => {
                json!({ "npc": npc, "op": op, "level": level })
            }
            ConditionKind::QuestStatus { quest, status } => {
                json!({ "quest": quest, "status": status })
            }
            ConditionKind::Extension(ext) => ext.params(),
            ConditionKind::Unknown { params, .. } => params.clone(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ConditionKind::Boolean(value) => format!("always {}", value),
            ConditionKind::VariableCompare {
                name,
                scope,
                op,
                value,
            } => format!("{}.{} {} {}", scope.as_str(), name, op.symbol(), value),
            ConditionKind::InputMatch { input } => format!("input is \"{}\"", input),
            ConditionKind::Expression { source, .. } => source.clone(),
            ConditionKind::ObjectiveComplete { quest, objective } => {
                format!("objective '{}' of quest '{}' complete", objective, quest)
            }
            ConditionKind::RelationshipThreshold { npc, op, level } => {
                format!("relationship with {} {} {}", npc, op.symbol(), level)
            }
            ConditionKind::QuestStatus { quest, status } => {
                format!("quest '{}' is {}", quest, status)
            }
            ConditionKind::Extension(ext) => ext.describe(),
            ConditionKind::Unknown { tag, .. } => format!("unknown condition '{}'", tag),
        }
    }

    /// Raw predicate before inversion; absent variables yield `false`.
    fn check(&self, ctx: &Context) -> bool {
        match self {
            ConditionKind::Boolean(value) => *value,
            ConditionKind::VariableCompare {
                name,
                scope,
                op,
                value,
            } => ctx
                .lookup(*scope, name)
                .map(|current| op.apply(current, value))
                .unwrap_or(false),
            ConditionKind::InputMatch { input } => ctx.input == *input,
            ConditionKind::Expression { expr, .. } => expr.evaluate(ctx),
            ConditionKind::ObjectiveComplete { quest, objective } => ctx
                .get_var(&objective_key(quest, objective))
                .map(Value::is_truthy)
                .unwrap_or(false),
            ConditionKind::RelationshipThreshold { npc, op, level } => ctx
                .get_var(&relationship_key(npc))
                .map(|current| current.is_numeric() && op.apply(current, level))
                .unwrap_or(false),
            ConditionKind::QuestStatus { quest, status } => ctx
                .get_var(&quest_status_key(quest))
                .and_then(Value::as_str)
                .map(|current| current == status)
                .unwrap_or(false),
            ConditionKind::Extension(ext) => ext.evaluate(ctx),
            ConditionKind::Unknown { .. } => false,
        }
    }
}

/// A single predicate in a transition's guard conjunction.
#[derive(Debug, Clone)]
pub struct Condition {
    pub id: String,
    pub name: String,
    pub inverted: bool,
    pub kind: ConditionKind,
}

impl Condition {
    pub fn new(kind: ConditionKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: kind.tag().to_string(),
            inverted: false,
            kind,
        }
    }

    pub fn boolean(value: bool) -> Self {
        Self::new(ConditionKind::Boolean(value))
    }

    pub fn input(input: impl Into<String>) -> Self {
        Self::new(ConditionKind::InputMatch {
            input: input.into(),
        })
    }

    pub fn variable(scope: Scope, name: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::new(ConditionKind::VariableCompare {
            name: name.into(),
            scope,
            op,
            value: value.into(),
        })
    }

    pub fn expression(source: &str) -> Result<Self, CoreError> {
        let expr = GuardExpr::parse(source)?;
        Ok(Self::new(ConditionKind::Expression {
            source: source.to_string(),
            expr,
        }))
    }

    pub fn objective_complete(quest: impl Into<String>, objective: impl Into<String>) -> Self {
        Self::new(ConditionKind::ObjectiveComplete {
            quest: quest.into(),
            objective: objective.into(),
        })
    }

    pub fn relationship(npc: impl Into<String>, op: CompareOp, level: impl Into<Value>) -> Self {
        Self::new(ConditionKind::RelationshipThreshold {
            npc: npc.into(),
            op,
            level: level.into(),
        })
    }

    pub fn quest_status(quest: impl Into<String>, status: impl Into<String>) -> Self {
        Self::new(ConditionKind::QuestStatus {
            quest: quest.into(),
            status: status.into(),
        })
    }

    pub fn extension(ext: Arc<dyn ConditionExtension>) -> Self {
        Self::new(ConditionKind::Extension(ext))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn invert(mut self) -> Self {
        self.inverted = !self.inverted;
        self
    }

    pub fn tag(&self) -> &str {
        self.kind.tag()
    }

    pub fn describe(&self) -> String {
        if self.inverted {
            format!("not ({})", self.kind.describe())
        } else {
            self.kind.describe()
        }
    }

    /// Evaluates the predicate, applying inversion. Unknown conditions are
    /// false whether inverted or not.
    pub fn evaluate(&self, ctx: &Context) -> bool {
        if matches!(self.kind, ConditionKind::Unknown { .. }) {
            return false;
        }
        self.kind.check(ctx) != self.inverted
    }
}

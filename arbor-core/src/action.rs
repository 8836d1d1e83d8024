//! Side effects run on node entry and exit.

use crate::context::{objective_key, quest_status_key, relationship_key, Context, Scope};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

pub const TAG_SET_VARIABLE: &str = "set_variable";
pub const TAG_ADD_TO_VARIABLE: &str = "add_to_variable";
pub const TAG_LOG: &str = "log";
pub const TAG_COMPLETE_OBJECTIVE: &str = "complete_objective";
pub const TAG_SET_QUEST_STATUS: &str = "set_quest_status";
pub const TAG_MODIFY_RELATIONSHIP: &str = "modify_relationship";

/// Failure of a single action. Logged by the node; never aborts the step.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("variable '{name}' holds a {found} value, expected a number")]
    NotNumeric { name: String, found: &'static str },

    #[error("cannot write to {scope} variable '{name}'")]
    ReadOnly { scope: &'static str, name: String },

    #[error("action failed: {0}")]
    Failed(String),
}

/// Host-provided action behaviour, registered under its own tag.
pub trait ActionExtension: fmt::Debug + Send + Sync {
    fn tag(&self) -> &str;

    fn execute(&self, ctx: &mut Context) -> Result<(), ActionError>;

    fn describe(&self) -> String {
        self.tag().to_string()
    }

    fn params(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub enum ActionKind {
    SetVariable {
        name: String,
        scope: Scope,
        value: Value,
    },
    AddToVariable {
        name: String,
        scope: Scope,
        amount: Value,
    },
    Log {
        message: String,
        level: LogLevel,
    },
    CompleteObjective {
        quest: String,
        objective: String,
    },
    SetQuestStatus {
        quest: String,
        status: String,
    },
    ModifyRelationship {
        npc: String,
        delta: i64,
    },
    Extension(Arc<dyn ActionExtension>),
    /// Produced on load for a tag nobody registered. Does nothing.
    Noop {
        tag: String,
        params: serde_json::Value,
    },
}

impl ActionKind {
    pub fn tag(&self) -> &str {
        match self {
            ActionKind::SetVariable { .. } => TAG_SET_VARIABLE,
            ActionKind::AddToVariable { .. } => TAG_ADD_TO_VARIABLE,
            ActionKind::Log { .. } => TAG_LOG,
            ActionKind::CompleteObjective { .. } => TAG_COMPLETE_OBJECTIVE,
            ActionKind::SetQuestStatus { .. } => TAG_SET_QUEST_STATUS,
            ActionKind::ModifyRelationship { .. } => TAG_MODIFY_RELATIONSHIP,
            ActionKind::Extension(ext) => ext.tag(),
            ActionKind::Noop { tag, .. } => tag,
        }
    }

    pub fn params(&self) -> serde_json::Value {
        match self {
            ActionKind::SetVariable { name, scope, value } => {
                json!({ "name": name, "scope": scope, "value": value })
            }
            ActionKind::AddToVariable {
                name,
                scope,
                amount,
            } => json!({ "name": name, "scope": scope, "amount": amount }),
            ActionKind::Log { message, level } => json!({ "message": message, "level": level }),
            ActionKind::CompleteObjective { quest, objective } => {
                json!({ "quest": quest, "objective": objective })
            }
            ActionKind::SetQuestStatus { quest, status } => {
                json!({ "quest": quest, "status": status })
            }
            ActionKind::ModifyRelationship { npc, delta } => json!({ "npc": npc, "delta": delta }),
            ActionKind::Extension(ext) => ext.params(),
            ActionKind::Noop { params, .. } => params.clone(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ActionKind::SetVariable { name, scope, value } => {
                format!("set {}.{} = {}", scope.as_str(), name, value)
            }
            ActionKind::AddToVariable {
                name,
                scope,
                amount,
            } => format!("add {} to {}.{}", amount, scope.as_str(), name),
            ActionKind::Log { message, .. } => format!("log \"{}\"", message),
            ActionKind::CompleteObjective { quest, objective } => {
                format!("complete objective '{}' of quest '{}'", objective, quest)
            }
            ActionKind::SetQuestStatus { quest, status } => {
                format!("mark quest '{}' {}", quest, status)
            }
            ActionKind::ModifyRelationship { npc, delta } => {
                format!("change relationship with {} by {}", npc, delta)
            }
            ActionKind::Extension(ext) => ext.describe(),
            ActionKind::Noop { tag, .. } => format!("unknown action '{}'", tag),
        }
    }
}

/// A named side effect attached to a node.
#[derive(Debug, Clone)]
pub struct Action {
    pub id: String,
    pub name: String,
    pub kind: ActionKind,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: kind.tag().to_string(),
            kind,
        }
    }

    pub fn set_variable(scope: Scope, name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(ActionKind::SetVariable {
            name: name.into(),
            scope,
            value: value.into(),
        })
    }

    pub fn add_to_variable(scope: Scope, name: impl Into<String>, amount: impl Into<Value>) -> Self {
        Self::new(ActionKind::AddToVariable {
            name: name.into(),
            scope,
            amount: amount.into(),
        })
    }

    pub fn log(message: impl Into<String>, level: LogLevel) -> Self {
        Self::new(ActionKind::Log {
            message: message.into(),
            level,
        })
    }

    pub fn complete_objective(quest: impl Into<String>, objective: impl Into<String>) -> Self {
        Self::new(ActionKind::CompleteObjective {
            quest: quest.into(),
            objective: objective.into(),
        })
    }

    pub fn set_quest_status(quest: impl Into<String>, status: impl Into<String>) -> Self {
        Self::new(ActionKind::SetQuestStatus {
            quest: quest.into(),
            status: status.into(),
        })
    }

    pub fn modify_relationship(npc: impl Into<String>, delta: i64) -> Self {
        Self::new(ActionKind::ModifyRelationship {
            npc: npc.into(),
            delta,
        })
    }

    pub fn extension(ext: Arc<dyn ActionExtension>) -> Self {
        Self::new(ActionKind::Extension(ext))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn tag(&self) -> &str {
        self.kind.tag()
    }

    pub fn describe(&self) -> String {
        self.kind.describe()
    }

    pub fn execute(&self, ctx: &mut Context) -> Result<(), ActionError> {
        match &self.kind {
            ActionKind::SetVariable { name, scope, value } => {
                if !ctx.set(*scope, name.clone(), value.clone()) {
                    return Err(ActionError::ReadOnly {
                        scope: scope.as_str(),
                        name: name.clone(),
                    });
                }
                Ok(())
            }
            ActionKind::AddToVariable {
                name,
                scope,
                amount,
            } => add_to(ctx, *scope, name, amount),
            ActionKind::Log { message, level } => {
                match level {
                    LogLevel::Trace => trace!(action = %self.name, "{}", message),
                    LogLevel::Debug => debug!(action = %self.name, "{}", message),
                    LogLevel::Info => info!(action = %self.name, "{}", message),
                    LogLevel::Warn => warn!(action = %self.name, "{}", message),
                    LogLevel::Error => error!(action = %self.name, "{}", message),
                }
                Ok(())
            }
            ActionKind::CompleteObjective { quest, objective } => {
                ctx.set(Scope::Global, objective_key(quest, objective), Value::Bool(true));
                Ok(())
            }
            ActionKind::SetQuestStatus { quest, status } => {
                ctx.set(Scope::Global, quest_status_key(quest), Value::Str(status.clone()));
                Ok(())
            }
            ActionKind::ModifyRelationship { npc, delta } => {
                add_to(ctx, Scope::Global, &relationship_key(npc), &Value::Int(*delta))
            }
            ActionKind::Extension(ext) => ext.execute(ctx),
            ActionKind::Noop { .. } => Ok(()),
        }
    }
}

/// Adds `amount` to a numeric variable, creating it when absent. Int plus
/// int stays int; any float operand yields a float.
fn add_to(ctx: &mut Context, scope: Scope, name: &str, amount: &Value) -> Result<(), ActionError> {
    let Some(table) = ctx.table_mut(scope) else {
        return Err(ActionError::ReadOnly {
            scope: scope.as_str(),
            name: name.to_string(),
        });
    };

    let current = table.get(name).cloned().unwrap_or(match amount {
        Value::Float(_) => Value::Float(0.0),
        _ => Value::Int(0),
    });

    let sum = match (&current, amount) {
        (Value::Int(a), Value::Int(b)) => Value::Int(a.saturating_add(*b)),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => Value::Float(a + b),
            (None, _) => {
                return Err(ActionError::NotNumeric {
                    name: name.to_string(),
                    found: current.type_name(),
                })
            }
            (_, None) => {
                return Err(ActionError::NotNumeric {
                    name: format!("{} (amount)", name),
                    found: amount.type_name(),
                })
            }
        },
    };

    table.insert(name.to_string(), sum);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_variable() {
        let mut ctx = Context::new("");
        Action::set_variable(Scope::Global, "door", "open").execute(&mut ctx).unwrap();
        assert_eq!(ctx.lookup(Scope::Global, "door"), Some(&Value::from("open")));

        let err = Action::set_variable(Scope::Param, "door", "open").execute(&mut ctx);
        assert!(matches!(err, Err(ActionError::ReadOnly { .. })));
    }

    #[test]
    fn test_add_to_variable_keeps_int_type() {
        let mut ctx = Context::new("");
        let add = Action::add_to_variable(Scope::Local, "kills", 1);
        add.execute(&mut ctx).unwrap();
        add.execute(&mut ctx).unwrap();
        assert_eq!(ctx.lookup(Scope::Local, "kills"), Some(&Value::Int(2)));

        Action::add_to_variable(Scope::Local, "kills", 0.5).execute(&mut ctx).unwrap();
        assert_eq!(ctx.lookup(Scope::Local, "kills"), Some(&Value::Float(2.5)));
    }

    #[test]
    fn test_add_to_non_numeric_fails() {
        let mut ctx = Context::new("");
        ctx.set(Scope::Global, "name", Value::from("mira"));
        let err = Action::add_to_variable(Scope::Global, "name", 1).execute(&mut ctx);
        assert!(matches!(err, Err(ActionError::NotNumeric { found: "string", .. })));
        assert_eq!(ctx.lookup(Scope::Global, "name"), Some(&Value::from("mira")));
    }

    #[test]
    fn test_domain_actions_write_globals() {
        let mut ctx = Context::new("");
        Action::complete_objective("wolves", "kill").execute(&mut ctx).unwrap();
        Action::set_quest_status("wolves", "done").execute(&mut ctx).unwrap();
        Action::modify_relationship("mira", 15).execute(&mut ctx).unwrap();
        Action::modify_relationship("mira", -5).execute(&mut ctx).unwrap();

        assert_eq!(
            ctx.lookup(Scope::Global, &objective_key("wolves", "kill")),
            Some(&Value::Bool(true))
        );
        assert_eq!(
            ctx.lookup(Scope::Global, &quest_status_key("wolves")),
            Some(&Value::from("done"))
        );
        assert_eq!(
            ctx.lookup(Scope::Global, &relationship_key("mira")),
            Some(&Value::Int(10))
        );
    }

    #[test]
    fn test_noop_and_log_succeed() {
        let mut ctx = Context::new("");
        let noop = Action::new(ActionKind::Noop {
            tag: "spawn_particles".into(),
            params: serde_json::Value::Null,
        });
        assert!(noop.execute(&mut ctx).is_ok());
        assert_eq!(noop.tag(), "spawn_particles");
        assert!(Action::log("entered cave", LogLevel::Debug).execute(&mut ctx).is_ok());
    }
}

//! Tag -> factory registry for condition and action variants.
//!
//! Save files carry each condition and action as a type tag plus a JSON
//! parameter object. On load the tag is looked up here; built-in variants are
//! pre-registered and hosts add their own with [`VariantRegistry::register_condition`]
//! and [`VariantRegistry::register_action`]. A tag that nobody registered, or
//! parameters a factory rejects, degrade to [`ConditionKind::Unknown`] /
//! [`ActionKind::Noop`] so one bad entry never aborts a load.

use crate::action::{self, ActionKind, LogLevel};
use crate::condition::{self, ConditionKind};
use crate::context::Scope;
use crate::error::CoreError;
use crate::guard::GuardExpr;
use crate::value::{CompareOp, Value};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

pub type ConditionFactory =
    Box<dyn Fn(&serde_json::Value) -> Result<ConditionKind, CoreError> + Send + Sync>;
pub type ActionFactory = Box<dyn Fn(&serde_json::Value) -> Result<ActionKind, CoreError> + Send + Sync>;

pub struct VariantRegistry {
    conditions: HashMap<String, ConditionFactory>,
    actions: HashMap<String, ActionFactory>,
}

impl fmt::Debug for VariantRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut conditions: Vec<_> = self.conditions.keys().collect();
        let mut actions: Vec<_> = self.actions.keys().collect();
        conditions.sort();
        actions.sort();
        f.debug_struct("VariantRegistry")
            .field("conditions", &conditions)
            .field("actions", &actions)
            .finish()
    }
}

impl Default for VariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_params<T: DeserializeOwned>(tag: &str, params: &serde_json::Value) -> Result<T, CoreError> {
    serde_json::from_value(params.clone()).map_err(|e| CoreError::InvalidVariant {
        tag: tag.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Deserialize)]
struct BooleanParams {
    value: bool,
}

#[derive(Deserialize)]
struct VariableParams {
    name: String,
    #[serde(default)]
    scope: Scope,
    op: CompareOp,
    value: Value,
}

#[derive(Deserialize)]
struct InputParams {
    input: String,
}

#[derive(Deserialize)]
struct ExpressionParams {
    expr: String,
}

#[derive(Deserialize)]
struct ObjectiveParams {
    quest: String,
    objective: String,
}

#[derive(Deserialize)]
struct RelationshipParams {
    npc: String,
    op: CompareOp,
    level: Value,
}

#[derive(Deserialize)]
struct QuestStatusParams {
    quest: String,
    status: String,
}

#[derive(Deserialize)]
struct SetVariableParams {
    name: String,
    #[serde(default)]
    scope: Scope,
    value: Value,
}

#[derive(Deserialize)]
struct AddToVariableParams {
    name: String,
    #[serde(default)]
    scope: Scope,
    amount: Value,
}

#[derive(Deserialize)]
struct LogParams {
    message: String,
    #[serde(default)]
    level: LogLevel,
}

#[derive(Deserialize)]
struct RelationshipDeltaParams {
    npc: String,
    delta: i64,
}

impl VariantRegistry {
    /// Creates a registry with every built-in variant registered.
    pub fn new() -> Self {
        let mut registry = Self::empty();

        registry.register_condition(condition::TAG_BOOLEAN, |p| {
            let p: BooleanParams = parse_params(condition::TAG_BOOLEAN, p)?;
            Ok(ConditionKind::Boolean(p.value))
        });
        registry.register_condition(condition::TAG_VARIABLE, |p| {
            let p: VariableParams = parse_params(condition::TAG_VARIABLE, p)?;
            Ok(ConditionKind::VariableCompare {
                name: p.name,
                scope: p.scope,
                op: p.op,
                value: p.value,
            })
        });
        registry.register_condition(condition::TAG_INPUT, |p| {
            let p: InputParams = parse_params(condition::TAG_INPUT, p)?;
            Ok(ConditionKind::InputMatch { input: p.input })
        });
        registry.register_condition(condition::TAG_EXPRESSION, |p| {
            let p: ExpressionParams = parse_params(condition::TAG_EXPRESSION, p)?;
            let expr = GuardExpr::parse(&p.expr)?;
            Ok(ConditionKind::Expression {
                source: p.expr,
                expr,
            })
        });
        registry.register_condition(condition::TAG_OBJECTIVE_COMPLETE, |p| {
            let p: ObjectiveParams = parse_params(condition::TAG_OBJECTIVE_COMPLETE, p)?;
            Ok(ConditionKind::ObjectiveComplete {
                quest: p.quest,
                objective: p.objective,
            })
        });
        registry.register_condition(condition::TAG_RELATIONSHIP, |p| {
            let p: RelationshipParams = parse_params(condition::TAG_RELATIONSHIP, p)?;
            Ok(ConditionKind::RelationshipThreshold {
                npc: p.npc,
                op: p.op,
                level: p.level,
            })
        });
        registry.register_condition(condition::TAG_QUEST_STATUS, |p| {
            let p: QuestStatusParams = parse_params(condition::TAG_QUEST_STATUS, p)?;
            Ok(ConditionKind::QuestStatus {
                quest: p.quest,
                status: p.status,
            })
        });

        registry.register_action(action::TAG_SET_VARIABLE, |p| {
            let p: SetVariableParams = parse_params(action::TAG_SET_VARIABLE, p)?;
            Ok(ActionKind::SetVariable {
                name: p.name,
                scope: p.scope,
                value: p.value,
            })
        });
        registry.register_action(action::TAG_ADD_TO_VARIABLE, |p| {
            let p: AddToVariableParams = parse_params(action::TAG_ADD_TO_VARIABLE, p)?;
            Ok(ActionKind::AddToVariable {
                name: p.name,
                scope: p.scope,
                amount: p.amount,
            })
        });
        registry.register_action(action::TAG_LOG, |p| {
            let p: LogParams = parse_params(action::TAG_LOG, p)?;
            Ok(ActionKind::Log {
                message: p.message,
                level: p.level,
            })
        });
        registry.register_action(action::TAG_COMPLETE_OBJECTIVE, |p| {
            let p: ObjectiveParams = parse_params(action::TAG_COMPLETE_OBJECTIVE, p)?;
            Ok(ActionKind::CompleteObjective {
                quest: p.quest,
                objective: p.objective,
            })
        });
        registry.register_action(action::TAG_SET_QUEST_STATUS, |p| {
            let p: QuestStatusParams = parse_params(action::TAG_SET_QUEST_STATUS, p)?;
            Ok(ActionKind::SetQuestStatus {
                quest: p.quest,
                status: p.status,
            })
        });
        registry.register_action(action::TAG_MODIFY_RELATIONSHIP, |p| {
            let p: RelationshipDeltaParams = parse_params(action::TAG_MODIFY_RELATIONSHIP, p)?;
            Ok(ActionKind::ModifyRelationship {
                npc: p.npc,
                delta: p.delta,
            })
        });

        registry
    }

    /// Creates a registry without the built-ins.
    pub fn empty() -> Self {
        Self {
            conditions: HashMap::new(),
            actions: HashMap::new(),
        }
    }

    /// Registers (or replaces) the factory for a condition tag.
    pub fn register_condition<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<ConditionKind, CoreError> + Send + Sync + 'static,
    {
        self.conditions.insert(tag.into(), Box::new(factory));
    }

    pub fn register_action<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<ActionKind, CoreError> + Send + Sync + 'static,
    {
        self.actions.insert(tag.into(), Box::new(factory));
    }

    pub fn has_condition(&self, tag: &str) -> bool {
        self.conditions.contains_key(tag)
    }

    pub fn has_action(&self, tag: &str) -> bool {
        self.actions.contains_key(tag)
    }

    /// Builds a condition kind, degrading to `Unknown` on any failure.
    pub fn build_condition(&self, tag: &str, params: &serde_json::Value) -> ConditionKind {
        let unknown = || ConditionKind::Unknown {
            tag: tag.to_string(),
            params: params.clone(),
        };
        match self.conditions.get(tag) {
            Some(factory) => factory(params).unwrap_or_else(|e| {
                warn!(tag, error = %e, "condition parameters rejected; treating as always false");
                unknown()
            }),
            None => {
                warn!(tag, "unknown condition type; treating as always false");
                unknown()
            }
        }
    }

    /// Builds an action kind, degrading to `Noop` on any failure.
    pub fn build_action(&self, tag: &str, params: &serde_json::Value) -> ActionKind {
        let noop = || ActionKind::Noop {
            tag: tag.to_string(),
            params: params.clone(),
        };
        match self.actions.get(tag) {
            Some(factory) => factory(params).unwrap_or_else(|e| {
                warn!(tag, error = %e, "action parameters rejected; action will do nothing");
                noop()
            }),
            None => {
                warn!(tag, "unknown action type; action will do nothing");
                noop()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::condition::Condition;
    use crate::context::Context;
    use serde_json::json;

    #[test]
    fn test_builtins_rebuild_from_own_params() {
        let registry = VariantRegistry::new();
        let conditions = vec![
            Condition::boolean(true),
            Condition::input("go"),
            Condition::variable(Scope::Global, "gold", CompareOp::Ge, 5),
            Condition::expression("var.gold > 1").unwrap(),
            Condition::objective_complete("q", "o"),
            Condition::relationship("mira", CompareOp::Lt, 10),
            Condition::quest_status("q", "done"),
        ];
        for cond in conditions {
            let rebuilt = registry.build_condition(cond.tag(), &cond.kind.params());
            assert_eq!(rebuilt.tag(), cond.tag());
            assert_eq!(rebuilt.describe(), cond.kind.describe());
        }

        let actions = vec![
            Action::set_variable(Scope::Local, "x", 1),
            Action::add_to_variable(Scope::Global, "x", 2.5),
            Action::log("hello", LogLevel::Warn),
            Action::complete_objective("q", "o"),
            Action::set_quest_status("q", "done"),
            Action::modify_relationship("mira", -3),
        ];
        for act in actions {
            let rebuilt = registry.build_action(act.tag(), &act.kind.params());
            assert_eq!(rebuilt.tag(), act.tag());
            assert_eq!(rebuilt.describe(), act.kind.describe());
        }
    }

    #[test]
    fn test_unknown_tags_degrade() {
        let registry = VariantRegistry::new();
        let kind = registry.build_condition("weather_is", &json!({"weather": "rain"}));
        assert!(matches!(kind, ConditionKind::Unknown { ref tag, .. } if tag == "weather_is"));
        assert_eq!(kind.params(), json!({"weather": "rain"}));

        let kind = registry.build_action("play_sound", &json!(null));
        assert!(matches!(kind, ActionKind::Noop { .. }));
    }

    #[test]
    fn test_bad_params_degrade() {
        let registry = VariantRegistry::new();
        let kind = registry.build_condition(condition::TAG_VARIABLE, &json!({"name": 3}));
        assert!(matches!(kind, ConditionKind::Unknown { .. }));

        let kind = registry.build_condition(condition::TAG_EXPRESSION, &json!({"expr": "(("}));
        assert!(matches!(kind, ConditionKind::Unknown { .. }));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = VariantRegistry::empty();
        assert!(!registry.has_condition(condition::TAG_BOOLEAN));

        registry.register_condition("weather_is", |p| {
            let wanted = p
                .get("weather")
                .and_then(|v| v.as_str())
                .ok_or_else(|| CoreError::InvalidVariant {
                    tag: "weather_is".into(),
                    reason: "missing weather".into(),
                })?
                .to_string();
            Ok(ConditionKind::VariableCompare {
                name: "weather".into(),
                scope: Scope::Global,
                op: CompareOp::Eq,
                value: Value::Str(wanted),
            })
        });

        let kind = registry.build_condition("weather_is", &json!({"weather": "rain"}));
        let cond = Condition::new(kind);
        let mut ctx = Context::new("");
        ctx.set(Scope::Global, "weather", Value::from("rain"));
        assert!(cond.evaluate(&ctx));
    }
}

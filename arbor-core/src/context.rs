//! Transient evaluation scope for one input step.

use crate::value::{Value, VarTable};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which variable table a condition or action addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Local,
    Global,
    Param,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Local => "local",
            Scope::Global => "global",
            Scope::Param => "param",
        }
    }
}

/// Inputs and variable tables visible to conditions and actions.
///
/// The controller moves its global table and the instance's locals into the
/// context for the duration of a step and takes them back afterwards, so
/// writes made by entry/exit actions are committed as a unit.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub input: String,
    pub params: VarTable,
    pub globals: VarTable,
    pub locals: VarTable,
    pub debug: bool,
}

impl Context {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn with_params(mut self, params: VarTable) -> Self {
        self.params = params;
        self
    }

    pub fn with_globals(mut self, globals: VarTable) -> Self {
        self.globals = globals;
        self
    }

    pub fn with_locals(mut self, locals: VarTable) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn lookup(&self, scope: Scope, name: &str) -> Option<&Value> {
        match scope {
            Scope::Local => self.locals.get(name),
            Scope::Global => self.globals.get(name),
            Scope::Param => self.params.get(name),
        }
    }

    /// Merged view: locals shadow globals.
    pub fn get_var(&self, name: &str) -> Option<&Value> {
        self.locals.get(name).or_else(|| self.globals.get(name))
    }

    /// Writes a variable. Params are read-only input; writes to them are
    /// ignored and reported as `false`.
    pub fn set(&mut self, scope: Scope, name: impl Into<String>, value: Value) -> bool {
        let table = match scope {
            Scope::Local => &mut self.locals,
            Scope::Global => &mut self.globals,
            Scope::Param => return false,
        };
        table.insert(name.into(), value);
        true
    }

    pub fn table_mut(&mut self, scope: Scope) -> Option<&mut VarTable> {
        match scope {
            Scope::Local => Some(&mut self.locals),
            Scope::Global => Some(&mut self.globals),
            Scope::Param => None,
        }
    }

    /// Emits a per-step trace line when debug tracing is enabled.
    pub fn trace(&self, what: &str) {
        if self.debug {
            debug!(input = %self.input, "{}", what);
        }
    }
}

/// Global variable holding the completion flag of a quest objective.
pub fn objective_key(quest: &str, objective: &str) -> String {
    format!("quest.{}.objective.{}", quest, objective)
}

pub fn quest_status_key(quest: &str) -> String {
    format!("quest.{}.status", quest)
}

pub fn relationship_key(npc: &str) -> String {
    format!("relationship.{}", npc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locals_shadow_globals() {
        let mut ctx = Context::new("look");
        ctx.set(Scope::Global, "gold", Value::Int(10));
        assert_eq!(ctx.get_var("gold"), Some(&Value::Int(10)));

        ctx.set(Scope::Local, "gold", Value::Int(3));
        assert_eq!(ctx.get_var("gold"), Some(&Value::Int(3)));
        assert_eq!(ctx.lookup(Scope::Global, "gold"), Some(&Value::Int(10)));
    }

    #[test]
    fn test_params_are_read_only() {
        let mut params = VarTable::new();
        params.insert("target".into(), Value::from("wolf"));
        let mut ctx = Context::new("attack").with_params(params);

        assert!(!ctx.set(Scope::Param, "target", Value::from("bear")));
        assert_eq!(ctx.lookup(Scope::Param, "target"), Some(&Value::from("wolf")));
    }

    #[test]
    fn test_domain_keys() {
        assert_eq!(objective_key("q1", "find"), "quest.q1.objective.find");
        assert_eq!(quest_status_key("q1"), "quest.q1.status");
        assert_eq!(relationship_key("mira"), "relationship.mira");
    }
}

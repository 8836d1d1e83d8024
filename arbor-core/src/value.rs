//! Typed scalar values and variable tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A typed scalar stored in state bags and variable tables.
///
/// Serialized as `{"type": "int", "value": 3}` so that integers and floats
/// keep their identity across a save/load round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Int(i64),
    Float(f64),
    #[serde(rename = "string")]
    Str(String),
    Bool(bool),
}

/// Ordered name -> value map. Ordered so save output is deterministic.
pub type VarTable = BTreeMap<String, Value>;

/// Per-node content data.
pub type StateBag = VarTable;

impl Value {
    /// Numeric view of the value. Ints are promoted to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Truthiness used by guard field checks.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
        }
    }

    /// Equality used by conditions: numbers compare exactly across
    /// int/float, everything else requires the same type.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => int_eq_float(*i, *f),
            _ => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "\"{}\"", s),
            Value::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Comparison operator shared by variable conditions and guard expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
}

impl CompareOp {
    /// Applies the operator. Ordering operators require numeric operands
    /// and are false otherwise.
    pub fn apply(&self, lhs: &Value, rhs: &Value) -> bool {
        let ordered = |cmp: fn(f64, f64) -> bool| match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => cmp(a, b),
            _ => false,
        };
        match self {
            CompareOp::Eq => lhs.loose_eq(rhs),
            CompareOp::Ne => !lhs.loose_eq(rhs),
            CompareOp::Gt => ordered(|a, b| a > b),
            CompareOp::Ge => ordered(|a, b| a >= b),
            CompareOp::Lt => ordered(|a, b| a < b),
            CompareOp::Le => ordered(|a, b| a <= b),
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }
}

/// Exact: the float must be integral and in range, so no rounding of
/// either side takes place.
fn int_eq_float(i: i64, f: f64) -> bool {
    f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 && f as i64 == i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality_across_types() {
        assert!(Value::Int(3).loose_eq(&Value::Float(3.0)));
        assert!(!Value::Int(3).loose_eq(&Value::Str("3".into())));
        assert!(!Value::Bool(true).loose_eq(&Value::Int(1)));
    }

    #[test]
    fn test_numeric_equality_is_exact() {
        assert!(!Value::Float(0.1 + 0.2).loose_eq(&Value::Float(0.3)));
        assert!(Value::Float(0.5).loose_eq(&Value::Float(0.5)));
        assert!(!Value::Int(0).loose_eq(&Value::Float(1e-20)));

        let big = 1i64 << 53;
        assert!(Value::Int(big).loose_eq(&Value::Float(big as f64)));
        assert!(!Value::Int(big + 1).loose_eq(&Value::Float(big as f64)));
        assert!(!Value::Float(big as f64).loose_eq(&Value::Int(big + 1)));
        assert!(!Value::Int(i64::MAX).loose_eq(&Value::Float(i64::MAX as f64)));
        assert!(!Value::Float(f64::NAN).loose_eq(&Value::Float(f64::NAN)));
        assert!(!Value::Int(0).loose_eq(&Value::Float(f64::NAN)));
        assert!(CompareOp::Ne.apply(&Value::Float(0.1 + 0.2), &Value::Float(0.3)));
    }

    #[test]
    fn test_ordering_requires_numbers() {
        assert!(CompareOp::Gt.apply(&Value::Int(5), &Value::Float(4.5)));
        assert!(CompareOp::Le.apply(&Value::Int(4), &Value::Int(4)));
        assert!(!CompareOp::Gt.apply(&Value::Str("b".into()), &Value::Str("a".into())));
        assert!(CompareOp::Ne.apply(&Value::Str("b".into()), &Value::Str("a".into())));
    }

    #[test]
    fn test_tagged_json_shape() {
        let json = serde_json::to_value(Value::Int(7)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "int", "value": 7}));

        let back: Value = serde_json::from_value(serde_json::json!({"type": "float", "value": 7.0})).unwrap();
        assert_eq!(back, Value::Float(7.0));

        let s: Value = serde_json::from_value(serde_json::json!({"type": "string", "value": "x"})).unwrap();
        assert_eq!(s, Value::Str("x".into()));
    }

    #[test]
    fn test_truthiness() {
        assert!(Value::Int(1).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Bool(true).is_truthy());
    }

    #[test]
    fn test_operator_serde_symbols() {
        let op: CompareOp = serde_json::from_str("\">=\"").unwrap();
        assert_eq!(op, CompareOp::Ge);
        assert_eq!(serde_json::to_string(&CompareOp::Ne).unwrap(), "\"!=\"");
    }
}

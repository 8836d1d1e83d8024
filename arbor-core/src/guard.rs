//! Guard expression evaluation.
//!
//! Guards are boolean expressions over the evaluation [`Context`]. The
//! expression language supports:
//!
//! - `local.name` - instance-local variable (truthy check)
//! - `global.name` - shared global variable
//! - `param.name` - parameter passed with the input
//! - `var.name` - merged lookup, locals shadow globals
//! - `input` - the active input string
//! - `field == value`, `field != value` - equality (strings, numbers, booleans)
//! - `field > value`, `>=`, `<`, `<=` - numeric ordering
//! - `!expr`, `expr && expr`, `expr || expr` - logic, `&&` binds tighter
//! - `(expr)` - grouping
//!
//! Variable names may contain dots, so `global.quest.q1.status == "done"`
//! addresses the global named `quest.q1.status`.
//!
//! Examples:
//! - `input == "go" && var.gold >= 10`
//! - `!(global.relationship.mira < 50)`

use crate::context::{Context, Scope};
use crate::error::CoreError;
use crate::value::{CompareOp, Value};

/// A field referenced by a guard.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRef {
    Input,
    Scoped(Scope, String),
    Merged(String),
}

impl FieldRef {
    fn resolve(&self, ctx: &Context) -> Option<Value> {
        match self {
            FieldRef::Input => Some(Value::Str(ctx.input.clone())),
            FieldRef::Scoped(scope, name) => ctx.lookup(*scope, name).cloned(),
            FieldRef::Merged(name) => ctx.get_var(name).cloned(),
        }
    }
}

/// A parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardExpr {
    /// Field is present and truthy.
    Truthy(FieldRef),
    /// Field compared against a literal.
    Compare(FieldRef, CompareOp, Value),
    And(Box<GuardExpr>, Box<GuardExpr>),
    Or(Box<GuardExpr>, Box<GuardExpr>),
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Parses a guard expression from a string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::InvalidGuard {
                reason: "empty guard expression".to_string(),
            });
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < parser.input.len() {
            return Err(CoreError::InvalidGuard {
                reason: format!("unexpected trailing input at offset {}", parser.pos),
            });
        }
        Ok(expr)
    }

    /// Evaluates the guard. Missing fields are falsy and fail every
    /// comparison, including `!=`.
    pub fn evaluate(&self, ctx: &Context) -> bool {
        match self {
            GuardExpr::Truthy(field) => field.resolve(ctx).map(|v| v.is_truthy()).unwrap_or(false),
            GuardExpr::Compare(field, op, expected) => field
                .resolve(ctx)
                .map(|v| op.apply(&v, expected))
                .unwrap_or(false),
            GuardExpr::And(left, right) => left.evaluate(ctx) && right.evaluate(ctx),
            GuardExpr::Or(left, right) => left.evaluate(ctx) || right.evaluate(ctx),
            GuardExpr::Not(inner) => !inner.evaluate(ctx),
        }
    }
}

/// Simple recursive descent parser for guard expressions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
}

const MAX_NESTING: usize = 64;

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
        }
    }

    fn parse_expr(&mut self) -> Result<GuardExpr, CoreError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(CoreError::InvalidGuard {
                reason: "expression nested too deeply".to_string(),
            });
        }
        let expr = self.parse_or();
        self.depth -= 1;
        expr
    }

    fn parse_or(&mut self) -> Result<GuardExpr, CoreError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = GuardExpr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<GuardExpr, CoreError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_unary()?;
            left = GuardExpr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<GuardExpr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            self.depth += 1;
            if self.depth > MAX_NESTING {
                return Err(CoreError::InvalidGuard {
                    reason: "expression nested too deeply".to_string(),
                });
            }
            let inner = self.parse_unary();
            self.depth -= 1;
            return Ok(GuardExpr::Not(Box::new(inner?)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<GuardExpr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('(') {
            self.pos += 1;
            let expr = self.parse_expr()?;
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(CoreError::InvalidGuard {
                    reason: "expected ')'".to_string(),
                });
            }
            self.pos += 1;
            return Ok(expr);
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<GuardExpr, CoreError> {
        let field = self.parse_field()?;
        self.skip_whitespace();

        let op = if self.peek_str("==") {
            CompareOp::Eq
        } else if self.peek_str("!=") {
            CompareOp::Ne
        } else if self.peek_str(">=") {
            CompareOp::Ge
        } else if self.peek_str("<=") {
            CompareOp::Le
        } else if self.peek_char() == Some('>') {
            CompareOp::Gt
        } else if self.peek_char() == Some('<') {
            CompareOp::Lt
        } else {
            return Ok(GuardExpr::Truthy(field));
        };
        self.pos += op.symbol().len();
        self.skip_whitespace();

        let value = match op {
            CompareOp::Eq | CompareOp::Ne => self.parse_value()?,
            _ => self.parse_number()?,
        };
        Ok(GuardExpr::Compare(field, op, value))
    }

    fn parse_field(&mut self) -> Result<FieldRef, CoreError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
        let word = &self.input[start..self.pos];
        if word == "input" {
            return Ok(FieldRef::Input);
        }

        let (prefix, name) = word.split_once('.').ok_or_else(|| CoreError::InvalidGuard {
            reason: format!(
                "field '{}' must start with 'local.', 'global.', 'param.' or 'var.'",
                word
            ),
        })?;
        if name.is_empty() {
            return Err(CoreError::InvalidGuard {
                reason: "empty field name".to_string(),
            });
        }

        let name = name.to_string();
        match prefix {
            "local" => Ok(FieldRef::Scoped(Scope::Local, name)),
            "global" => Ok(FieldRef::Scoped(Scope::Global, name)),
            "param" => Ok(FieldRef::Scoped(Scope::Param, name)),
            "var" => Ok(FieldRef::Merged(name)),
            other => Err(CoreError::InvalidGuard {
                reason: format!("unknown field scope '{}'", other),
            }),
        }
    }

    fn parse_value(&mut self) -> Result<Value, CoreError> {
        let rest = &self.input[self.pos..];

        if rest.starts_with("true") {
            self.pos += 4;
            return Ok(Value::Bool(true));
        }
        if rest.starts_with("false") {
            self.pos += 5;
            return Ok(Value::Bool(false));
        }
        if rest.starts_with('"') {
            return self.parse_string_value();
        }

        self.parse_number()
    }

    fn parse_string_value(&mut self) -> Result<Value, CoreError> {
        self.pos += 1;

        let mut out = String::new();
        let mut chars = self.input[self.pos..].char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += offset + 1;
                    return Ok(Value::Str(out));
                }
                '\\' => match chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => break,
                },
                c => out.push(c),
            }
        }

        Err(CoreError::InvalidGuard {
            reason: "unterminated string".to_string(),
        })
    }

    fn parse_number(&mut self) -> Result<Value, CoreError> {
        self.skip_whitespace();
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        self.skip_digits();

        let mut is_float = false;
        if self.peek_char() == Some('.') {
            is_float = true;
            self.pos += 1;
            self.skip_digits();
        }

        let num_str = &self.input[start..self.pos];
        let invalid = || CoreError::InvalidGuard {
            reason: format!("invalid number: '{}'", num_str),
        };
        if is_float {
            num_str.parse::<f64>().map(Value::Float).map_err(|_| invalid())
        } else {
            num_str.parse::<i64>().map(Value::Int).map_err(|_| invalid())
        }
    }

    fn skip_digits(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

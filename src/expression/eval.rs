use super::ast::{InfixOp, Node, PrefixOp};
use super::{functions, ExprError};
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Identifier resolution for the evaluator.
pub trait Scope {
    /// Resolve an identifier, including dotted forms such as
    /// `headers.Content-Type` or `variables.user.id`.
    fn lookup(&self, ident: &str) -> Option<Value>;

    /// Response body that `json_path`, `xml_path` and `html_path` run on.
    fn body(&self) -> Option<&str> {
        None
    }
}

pub struct Evaluator<'s> {
    scope: &'s dyn Scope,
    received: BTreeMap<String, Value>,
}

impl<'s> Evaluator<'s> {
    pub fn new(scope: &'s dyn Scope) -> Self {
        Self {
            scope,
            received: BTreeMap::new(),
        }
    }

    pub fn into_received(self) -> BTreeMap<String, Value> {
        self.received
    }

    pub(super) fn scope(&self) -> &dyn Scope {
        self.scope
    }

    pub(super) fn record(&mut self, key: String, value: &Value) {
        self.received.insert(key, value.clone());
    }

    pub fn eval(&mut self, node: &Node) -> Result<Value, ExprError> {
        match node {
            Node::Int(i) => Ok(Value::Int(*i)),
            Node::Float(f) => Ok(Value::Float(*f)),
            Node::Str(s) => Ok(Value::String(s.clone())),
            Node::Bool(b) => Ok(Value::Bool(*b)),
            Node::Null => Ok(Value::Null),
            Node::Ident(name) => {
                let value = self
                    .scope
                    .lookup(name)
                    .ok_or_else(|| ExprError::NotFound(format!("identifier '{name}'")))?;
                self.record(name.clone(), &value);
                Ok(value)
            }
            Node::Prefix { op, right } => {
                let value = self.eval(right)?;
                eval_prefix(*op, value)
            }
            Node::Infix { op, left, right } => self.eval_infix(*op, left, right),
            Node::Call { name, args } => functions::call(self, node, name, args),
            Node::Array(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Node::Object(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Map(map))
            }
        }
    }

    fn eval_infix(&mut self, op: InfixOp, left: &Node, right: &Node) -> Result<Value, ExprError> {
        if matches!(op, InfixOp::And | InfixOp::Or) {
            let lhs = expect_bool(self.eval(left)?, op)?;
            let short_circuit = match op {
                InfixOp::And => !lhs,
                _ => lhs,
            };
            if short_circuit {
                return Ok(Value::Bool(lhs));
            }
            return Ok(Value::Bool(expect_bool(self.eval(right)?, op)?));
        }

        let lhs = self.eval(left)?;
        let rhs = self.eval(right)?;
        match op {
            InfixOp::Eq => Ok(Value::Bool(lhs.loose_eq(&rhs))),
            InfixOp::NotEq => Ok(Value::Bool(!lhs.loose_eq(&rhs))),
            InfixOp::Lt | InfixOp::Gt => {
                let ordering = lhs.compare(&rhs).ok_or_else(|| {
                    unsupported(op, &lhs, &rhs)
                })?;
                Ok(Value::Bool(match op {
                    InfixOp::Lt => ordering == Ordering::Less,
                    _ => ordering == Ordering::Greater,
                }))
            }
            _ => arithmetic(op, lhs, rhs),
        }
    }
}

fn eval_prefix(op: PrefixOp, value: Value) -> Result<Value, ExprError> {
    match (op, value) {
        (PrefixOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (PrefixOp::Neg, Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| ExprError::Operator("integer overflow".into())),
        (PrefixOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (PrefixOp::Not, other) => Err(ExprError::Argument(format!(
            "'!' expects a bool, got {}",
            other.type_name()
        ))),
        (PrefixOp::Neg, other) => Err(ExprError::Argument(format!(
            "'-' expects a number, got {}",
            other.type_name()
        ))),
    }
}

fn expect_bool(value: Value, op: InfixOp) -> Result<bool, ExprError> {
    value.as_bool().ok_or_else(|| {
        ExprError::Argument(format!(
            "'{}' expects bool operands, got {}",
            op.symbol(),
            value.type_name()
        ))
    })
}

fn unsupported(op: InfixOp, lhs: &Value, rhs: &Value) -> ExprError {
    ExprError::Operator(format!(
        "{} {} {} is not supported",
        lhs.type_name(),
        op.symbol(),
        rhs.type_name()
    ))
}

fn arithmetic(op: InfixOp, lhs: Value, rhs: Value) -> Result<Value, ExprError> {
    match (&lhs, &rhs) {
        (Value::Int(a), Value::Int(b)) => {
            let (a, b) = (*a, *b);
            let result = match op {
                InfixOp::Add => a.checked_add(b),
                InfixOp::Sub => a.checked_sub(b),
                InfixOp::Mul => a.checked_mul(b),
                InfixOp::Div if b == 0 => {
                    return Err(ExprError::Operator("division by zero".into()))
                }
                InfixOp::Div => a.checked_div(b),
                _ => return Err(unsupported(op, &lhs, &rhs)),
            };
            result
                .map(Value::Int)
                .ok_or_else(|| ExprError::Operator("integer overflow".into()))
        }
        (a, b) if a.is_numeric() && b.is_numeric() => {
            let (a, b) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
            Ok(Value::Float(match op {
                InfixOp::Add => a + b,
                InfixOp::Sub => a - b,
                InfixOp::Mul => a * b,
                InfixOp::Div => a / b,
                _ => return Err(unsupported(op, &lhs, &rhs)),
            }))
        }
        _ => Err(unsupported(op, &lhs, &rhs)),
    }
}

//! Expression evaluation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{EvaluationError, ExpressionError};
use crate::expr::{CmpOp, Expression};

/// A variable or intermediate value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Num(f64),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Num(_) => "number",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Num(n as f64)
    }
}

/// Variable bindings for evaluation.
pub type Variables = HashMap<String, Value>;

impl Expression {
    /// Evaluate to a boolean.
    ///
    /// Every sub-expression is evaluated, so an error anywhere in the tree is
    /// reported even when the result would already be decided.
    pub fn evaluate(&self, variables: &Variables) -> Result<bool, ExpressionError> {
        match self.value(variables)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvaluationError::NotBoolean(other.kind()).into()),
        }
    }

    fn value(&self, variables: &Variables) -> Result<Value, EvaluationError> {
        match self {
            Expression::Bool(b) => Ok(Value::Bool(*b)),
            Expression::Number { value, .. } => Ok(Value::Num(*value)),
            Expression::Variable(name) => variables
                .get(name)
                .copied()
                .ok_or_else(|| EvaluationError::UndefinedVariable(name.clone())),
            Expression::Compare { op, lhs, rhs } => {
                let left = lhs.value(variables)?;
                let right = rhs.value(variables)?;
                compare(*op, left, right)
            }
            Expression::And(lhs, rhs) => {
                let left = lhs.value(variables)?;
                let right = rhs.value(variables)?;
                logical("&&", left, right, |a, b| a && b)
            }
            Expression::Or(lhs, rhs) => {
                let left = lhs.value(variables)?;
                let right = rhs.value(variables)?;
                logical("||", left, right, |a, b| a || b)
            }
        }
    }
}

fn compare(op: CmpOp, left: Value, right: Value) -> Result<Value, EvaluationError> {
    let result = match (left, right) {
        (Value::Num(a), Value::Num(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        },
        (Value::Bool(_), Value::Bool(_)) if !op.is_equality() => {
            return Err(EvaluationError::UnsupportedOperator {
                op: op.to_string(),
                kind: "bool",
            })
        }
        (Value::Bool(a), Value::Bool(b)) => (a == b) == (op == CmpOp::Eq),
        (l, r) => {
            return Err(EvaluationError::TypeMismatch {
                op: op.to_string(),
                left: l.kind(),
                right: r.kind(),
            })
        }
    };
    Ok(Value::Bool(result))
}

fn logical(
    op: &str,
    left: Value,
    right: Value,
    combine: impl Fn(bool, bool) -> bool,
) -> Result<Value, EvaluationError> {
    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(combine(a, b))),
        (Value::Num(_), Value::Num(_)) => Err(EvaluationError::UnsupportedOperator {
            op: op.to_string(),
            kind: "number",
        }),
        (l, r) => Err(EvaluationError::TypeMismatch {
            op: op.to_string(),
            left: l.kind(),
            right: r.kind(),
        }),
    }
}

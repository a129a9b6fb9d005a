//! Expression errors.

use thiserror::Error;

/// Errors produced while parsing or evaluating an expression.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    /// The expression text is malformed.
    #[error("parse error at offset {position}: {message}")]
    Parse { position: usize, message: String },

    /// The expression is well-formed but cannot be evaluated.
    #[error("evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),
}

impl ExpressionError {
    pub(crate) fn parse(position: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: message.into(),
        }
    }

    /// Returns true for parse errors.
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. })
    }
}

/// Reasons an expression fails to evaluate.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("cannot compare {left} with {right} using '{op}'")]
    TypeMismatch {
        op: String,
        left: &'static str,
        right: &'static str,
    },

    #[error("operator '{op}' is not defined for {kind} operands")]
    UnsupportedOperator { op: String, kind: &'static str },

    #[error("expression yields a {0}, expected bool")]
    NotBoolean(&'static str),
}

//! Expression tree.

use std::fmt;
use std::str::FromStr;

use crate::error::ExpressionError;
use crate::parser::Parser;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    /// Equality operators are the only comparisons defined on booleans.
    pub fn is_equality(self) -> bool {
        matches!(self, CmpOp::Eq | CmpOp::Ne)
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Bool(bool),
    Number {
        value: f64,
        /// Source text of the literal, sign included.
        raw: String,
        suffix: Option<String>,
    },
    Variable(String),
    Compare {
        op: CmpOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
}

impl Expression {
    /// Parse an expression.
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        Parser::new(input)?.parse()
    }

    /// Identifiers referenced by the expression, in order of first use.
    pub fn variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut Vec<String>) {
        match self {
            Expression::Variable(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expression::Compare { lhs, rhs, .. }
            | Expression::And(lhs, rhs)
            | Expression::Or(lhs, rhs) => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
            Expression::Bool(_) | Expression::Number { .. } => {}
        }
    }

    /// Binding strength, higher binds tighter.
    fn precedence(&self) -> u8 {
        match self {
            Expression::Or(..) => 1,
            Expression::And(..) => 2,
            Expression::Compare { .. } => 3,
            _ => 4,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        if self.precedence() < min {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Bool(b) => write!(f, "{b}"),
            Expression::Number { raw, suffix, .. } => {
                f.write_str(raw)?;
                if let Some(suffix) = suffix {
                    f.write_str(suffix)?;
                }
                Ok(())
            }
            Expression::Variable(name) => f.write_str(name),
            Expression::Compare { op, lhs, rhs } => {
                lhs.fmt_operand(f, 4)?;
                write!(f, " {op} ")?;
                rhs.fmt_operand(f, 4)
            }
            Expression::And(lhs, rhs) => {
                lhs.fmt_operand(f, 2)?;
                f.write_str(" && ")?;
                rhs.fmt_operand(f, 3)
            }
            Expression::Or(lhs, rhs) => {
                lhs.fmt_operand(f, 1)?;
                f.write_str(" || ")?;
                rhs.fmt_operand(f, 2)
            }
        }
    }
}

impl FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

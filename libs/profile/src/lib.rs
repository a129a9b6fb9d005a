//! # flotta-profile
//!
//! Device profiles: named lists of boolean conditions over device metrics.
//!
//! A condition is an expression such as
//! `(cpu == 23% && mem >= 20Gib) || (x <= 20 && y == 20%)`, evaluated against a
//! map of numeric or boolean variables. A profile's state is the name of its
//! first condition that evaluates to true.
//!
//! ## Grammar
//!
//! ```text
//! or_expr    := and_expr ("||" and_expr)*
//! and_expr   := comparison ("&&" comparison)*
//! comparison := operand (cmp_op operand)?
//! operand    := "(" or_expr ")" | "true" | "false" | "-"? NUMBER SUFFIX? | IDENT
//! cmp_op     := "==" | "!=" | "<" | "<=" | ">" | ">="
//! ```
//!
//! A suffix (`%`, `Gib`, ...) written directly after a number is kept for
//! display only and never affects the numeric value.

mod error;
mod eval;
mod expr;
mod lexer;
mod parser;
mod profile;

pub use error::{EvaluationError, ExpressionError};
pub use eval::{Value, Variables};
pub use expr::{CmpOp, Expression};
pub use profile::{Condition, ConditionError, EvaluationReport, Profile, ProfileEvaluator, ProfileEvent};

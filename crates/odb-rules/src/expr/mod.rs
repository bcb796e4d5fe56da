//! Expression language of `sys.validate` rules.
//!
//! A rule expression is a small functional language over the JSON of the
//! operation being validated:
//!
//! ```text
//! std:eq(std:size(.new), 1)
//! auth:has_sig_roles(this, .old.0.owner_role)
//! set:in(str:first(.ref.op.id), set:all('sys.role', 'sys.grant'))
//! ```
//!
//! Expressions are parsed once into an [`Expr`] tree and evaluated against
//! an [`EvalContext`].

mod eval;
mod parser;
mod value;

use std::fmt;
use std::str::FromStr;

pub use eval::{EvalContext, SignerRoles};
pub use value::ExprValue;

/// Errors raised while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    #[error("error parsing expression '{expr}' at {pos}: {message}")]
    Parse {
        expr: String,
        pos: usize,
        message: String,
    },

    #[error("{0}")]
    Eval(String),
}

impl ExprError {
    pub(crate) fn eval(msg: impl Into<String>) -> Self {
        Self::Eval(msg.into())
    }
}

/// Built-in functions, addressed as `namespace:name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    StdEq,
    StdNeq,
    StdLeq,
    StdLe,
    StdSize,
    StdAnd,
    StdOr,
    MathPlus,
    MathMinus,
    MathMult,
    MathDiv,
    MathFieldsIntSum,
    StrFirst,
    StrSecond,
    StrAll,
    StrConcat,
    StrCombine,
    SetIn,
    SetAll,
    SetMinus,
    SetContainsKey,
    AuthHasSigRoles,
    OpType,
    OpFieldsChanged,
    OpObjGet,
}

const FUNCTIONS: &[(&str, Function)] = &[
    ("std:eq", Function::StdEq),
    ("std:neq", Function::StdNeq),
    ("std:leq", Function::StdLeq),
    ("std:le", Function::StdLe),
    ("std:size", Function::StdSize),
    ("std:and", Function::StdAnd),
    ("std:or", Function::StdOr),
    ("m:plus", Function::MathPlus),
    ("m:minus", Function::MathMinus),
    ("m:mult", Function::MathMult),
    ("m:div", Function::MathDiv),
    ("m:fields_int_sum", Function::MathFieldsIntSum),
    ("str:first", Function::StrFirst),
    ("str:second", Function::StrSecond),
    ("str:all", Function::StrAll),
    ("str:concat", Function::StrConcat),
    ("str:combine", Function::StrCombine),
    ("set:in", Function::SetIn),
    ("set:all", Function::SetAll),
    ("set:minus", Function::SetMinus),
    ("set:contains_key", Function::SetContainsKey),
    ("auth:has_sig_roles", Function::AuthHasSigRoles),
    ("op:op_type", Function::OpType),
    ("op:fields_changed", Function::OpFieldsChanged),
    ("op:obj_get", Function::OpObjGet),
];

impl Function {
    pub fn name(&self) -> &'static str {
        FUNCTIONS
            .iter()
            .find(|(_, f)| f == self)
            .map_or("?", |(n, _)| n)
    }
}

impl FromStr for Function {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FUNCTIONS
            .iter()
            .find(|(n, _)| *n == s)
            .map(|(_, f)| *f)
            .ok_or_else(|| format!("Unsupported function '{s}'"))
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Integer literal.
    Int(i64),
    /// Quoted string literal.
    Str(String),
    /// `this`: the whole evaluation context.
    This,
    /// `.field` on the evaluation context.
    Field(String),
    /// `expr.field`.
    Access(Box<Expr>, String),
    /// `ns:name(args...)`.
    Call(Function, Vec<Expr>),
}

impl Expr {
    pub fn parse(text: &str) -> Result<Self, ExprError> {
        parser::parse(text)
    }

    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<ExprValue, ExprError> {
        eval::evaluate(self, ctx)
    }

    pub fn evaluate_bool(&self, ctx: &EvalContext<'_>) -> Result<bool, ExprError> {
        Ok(self.evaluate(ctx)?.is_truthy())
    }
}

impl FromStr for Expr {
    type Err = ExprError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_names_roundtrip() {
        for (name, f) in FUNCTIONS {
            assert_eq!(name.parse::<Function>().unwrap(), *f);
            assert_eq!(f.name(), *name);
        }
        assert!("std:nope".parse::<Function>().is_err());
    }
}

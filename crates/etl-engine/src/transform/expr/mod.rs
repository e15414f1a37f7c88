//! Sandboxed evaluator for calculated columns
//!
//! Expressions are parsed into a small tagged AST and interpreted over whole
//! columns at once. Nothing outside the allowlist is reachable: arithmetic
//! (`+ - * / % **`), comparisons, `and`/`or`/`not`, literals, column
//! identifiers and the functions `abs`, `min`, `max`, `round`, `len`, `str`,
//! `int`, `float`.
//!
//! Identifiers name columns. Names that are not plain identifiers can be
//! written in backticks: `` `unit price` * qty ``.
//!
//! Semantics worth knowing:
//! - nulls propagate through arithmetic, comparisons and functions
//! - `/` always yields a numeric value; division or modulo by zero yields null
//! - `+` concatenates two text values
//! - `min(col)`/`max(col)` with a single column argument aggregate over the
//!   column; with two or more arguments they compare row by row

mod eval;
mod lexer;
mod parser;

use thiserror::Error;

use crate::batch::{DataType, Value};

pub use eval::Scope;
pub use parser::{BinaryOp, Expr, Function, UnaryOp};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("syntax error at position {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("unknown function '{name}' (allowed: abs, min, max, round, len, str, int, float)")]
    UnknownFunction { name: String },

    #[error("unknown identifier '{name}'")]
    UnknownIdentifier { name: String },

    #[error("{0}")]
    Type(String),
}

/// A parsed calculated-column expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        Ok(Self {
            source: source.to_string(),
            ast: parser::parse(source)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn identifiers(&self) -> Vec<&str> {
        self.ast.identifiers()
    }

    /// Evaluate over `rows` rows. Returns the values and their common type
    /// (`None` when every value is null).
    pub fn evaluate(
        &self,
        scope: &dyn Scope,
        rows: usize,
    ) -> Result<(Option<DataType>, Vec<Value>), ExprError> {
        let values = eval::evaluate(&self.ast, scope, rows)?;
        unify(values)
    }
}

/// Give a result column one type: integers widen to numeric when mixed with
/// numerics, any other mix is an error.
fn unify(mut values: Vec<Value>) -> Result<(Option<DataType>, Vec<Value>), ExprError> {
    let mut seen: Vec<DataType> = Vec::new();
    for dt in values.iter().filter_map(Value::data_type) {
        if !seen.contains(&dt) {
            seen.push(dt);
        }
    }

    match seen.as_slice() {
        [] => Ok((None, values)),
        [only] => Ok((Some(*only), values)),
        [a, b]
            if (*a == DataType::Integer && *b == DataType::Numeric)
                || (*a == DataType::Numeric && *b == DataType::Integer) =>
        {
            for v in values.iter_mut() {
                if let Value::Integer(i) = v {
                    *v = Value::Numeric(*i as f64);
                }
            }
            Ok((Some(DataType::Numeric), values))
        },
        mixed => Err(ExprError::Type(format!(
            "expression yields values of mixed types ({})",
            mixed
                .iter()
                .map(DataType::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unify_widens_integers() {
        let (dt, values) = unify(vec![Value::Integer(1), Value::Numeric(0.5), Value::Null]).unwrap();
        assert_eq!(dt, Some(DataType::Numeric));
        assert_eq!(values[0], Value::Numeric(1.0));
    }

    #[test]
    fn test_unify_rejects_mixed() {
        assert!(unify(vec![Value::Integer(1), Value::Text("a".into())]).is_err());
    }

    #[test]
    fn test_unify_all_null() {
        assert_eq!(unify(vec![Value::Null]).unwrap().0, None);
    }
}

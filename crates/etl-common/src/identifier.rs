//! SQL identifier validation and quoting
//!
//! Destination schema, table and column names arrive from job definitions
//! and end up inside generated DDL/DML. They are validated once when a job is
//! checked and always emitted double-quoted.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::{CommonError, Result};

/// PostgreSQL truncates identifiers longer than this.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Words rejected as bare identifiers even though quoting would allow them.
pub const RESERVED_WORDS: &[&str] = &[
    "user", "table", "column", "index", "view", "select", "insert", "update", "delete", "create",
    "drop", "alter", "grant", "revoke",
];

#[allow(clippy::expect_used)]
static IDENTIFIER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("identifier pattern is a valid regex")
});

/// Validate a schema/table/column name.
///
/// `kind` is only used for the error message ("schema", "table", "column").
pub fn validate_identifier(name: &str, kind: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CommonError::invalid_identifier(kind, name, "name cannot be empty"));
    }

    if !IDENTIFIER_RE.is_match(name) {
        return Err(CommonError::invalid_identifier(
            kind,
            name,
            "must start with a letter or underscore and contain only letters, digits, \
             underscores and hyphens",
        ));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(CommonError::invalid_identifier(
            kind,
            name,
            format!("longer than {} characters", MAX_IDENTIFIER_LEN),
        ));
    }

    if RESERVED_WORDS.contains(&name.to_lowercase().as_str()) {
        return Err(CommonError::invalid_identifier(kind, name, "is a SQL reserved word"));
    }

    Ok(())
}

/// Quote an identifier for PostgreSQL, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"schema"."table"`
pub fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Quote and comma-join a list of column names.
pub fn quoted_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

//! Destination tables
//!
//! A [`Destination`] is one live connection to one destination table, held
//! for the duration of a run: reconciliation inspects and alters the table
//! through it, then the loader writes every slice through it, then it is
//! closed. [`DestinationConnector`] opens one from a job's destination config.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use etl_common::identifier::qualified_name;

use crate::batch::TabularBatch;
use crate::error::Result;
use crate::loader::WritePlan;
use crate::models::DestinationConfig;

pub use memory::{MemoryConnector, MemoryDestination, MemoryTable};
pub use postgres::{PgConnector, PgDestination};

/// Audit column stamped on first insert and never updated
pub const CREATED_AT: &str = "created_at";
/// Audit column bumped whenever an upsert changes a row
pub const UPDATED_AT: &str = "updated_at";

/// Audit columns are managed by the engine and left out of schema
/// comparisons.
pub fn is_audit_column(name: &str) -> bool {
    name == CREATED_AT || name == UPDATED_AT
}

/// Schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Quoted `"schema"."table"`
    pub fn qualified(&self) -> String {
        qualified_name(&self.schema, &self.table)
    }

    /// Unquoted `schema.table`, used as a lock key and in logs
    pub fn key(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl From<&DestinationConfig> for TableRef {
    fn from(config: &DestinationConfig) -> Self {
        Self::new(config.schema.clone(), config.table.clone())
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Type as the destination reports it, e.g. `character varying(255)`
    pub native_type: String,
    pub nullable: bool,
}

/// Point-in-time view of a table's columns, in ordinal order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaSnapshot {
    columns: Vec<ColumnInfo>,
}

impl SchemaSnapshot {
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn native_type(&self, name: &str) -> Option<&str> {
        self.column(name).map(|c| c.native_type.as_str())
    }

    /// Column names without the audit columns
    pub fn business_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|n| !is_audit_column(n))
            .collect()
    }
}

/// A PRIMARY KEY or UNIQUE constraint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub name: String,
    pub columns: Vec<String>,
    pub is_primary: bool,
}

impl UniqueConstraint {
    /// True when the constraint covers exactly `keys`, in any order.
    pub fn covers_exactly(&self, keys: &[String]) -> bool {
        self.columns.len() == keys.len() && keys.iter().all(|k| self.columns.contains(k))
    }
}

/// One open connection to one destination table
#[async_trait]
pub trait Destination: Send {
    fn table(&self) -> &TableRef;

    /// Current columns, or `None` when the table does not exist.
    async fn describe(&mut self) -> Result<Option<SchemaSnapshot>>;

    /// Run caller-provided DDL (table creation).
    async fn execute_ddl(&mut self, ddl: &str) -> Result<()>;

    async fn add_column(&mut self, name: &str, native_type: &str) -> Result<()>;

    async fn truncate(&mut self) -> Result<()>;

    async fn drop_table(&mut self) -> Result<()>;

    async fn unique_constraints(&mut self) -> Result<Vec<UniqueConstraint>>;

    /// Drop any existing primary key and add one on `columns`, atomically.
    async fn replace_primary_key(&mut self, columns: &[String]) -> Result<()>;

    /// Serialize runs on this table until the connection closes.
    async fn lock_table(&mut self) -> Result<()>;

    /// Write one slice atomically; returns the rows submitted.
    async fn write_slice(&mut self, plan: &WritePlan, slice: &TabularBatch) -> Result<u64>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens destinations from job configuration
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    async fn connect(&self, config: &DestinationConfig) -> Result<Box<dyn Destination>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ref() {
        let t = TableRef::new("sales", "orders");
        assert_eq!(t.qualified(), "\"sales\".\"orders\"");
        assert_eq!(t.key(), "sales.orders");
    }

    #[test]
    fn test_business_columns_skip_audit() {
        let snap = SchemaSnapshot::new(vec![
            ColumnInfo {
                name: "id".into(),
                native_type: "integer".into(),
                nullable: false,
            },
            ColumnInfo {
                name: CREATED_AT.into(),
                native_type: "timestamp without time zone".into(),
                nullable: false,
            },
        ]);
        assert_eq!(snap.business_columns(), vec!["id"]);
        assert_eq!(snap.native_type("id"), Some("integer"));
    }

    #[test]
    fn test_constraint_coverage_ignores_order() {
        let c = UniqueConstraint {
            name: "pk".into(),
            columns: vec!["a".into(), "b".into()],
            is_primary: true,
        };
        assert!(c.covers_exactly(&["b".to_string(), "a".to_string()]));
        assert!(!c.covers_exactly(&["a".to_string()]));
    }
}

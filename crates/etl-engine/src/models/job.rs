//! Job definitions and column mappings
//!
//! A job definition is read once per run and never mutated by the engine.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use etl_common::identifier::{qualified_name, validate_identifier};

use crate::batch::DataType;
use crate::error::{EngineError, Result};

/// Default number of rows written per slice.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_true() -> bool {
    true
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_start_row() -> u32 {
    1
}

/// How a transformed batch is merged into the destination table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadStrategy {
    #[default]
    Insert,
    Upsert,
    TruncateInsert,
}

impl LoadStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStrategy::Insert => "insert",
            LoadStrategy::Upsert => "upsert",
            LoadStrategy::TruncateInsert => "truncate_insert",
        }
    }
}

impl std::fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoadStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(LoadStrategy::Insert),
            "upsert" => Ok(LoadStrategy::Upsert),
            "truncate_insert" => Ok(LoadStrategy::TruncateInsert),
            other => Err(EngineError::InvalidJob(format!("unknown load strategy '{}'", other))),
        }
    }
}

/// Row/column window of a spreadsheet source. Rows are 1-based, columns are
/// A1-style letters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRange {
    #[serde(default = "default_start_row")]
    pub start_row: u32,
    /// Row holding the column names; defaults to `start_row`
    #[serde(default)]
    pub header_row: Option<u32>,
    #[serde(default)]
    pub end_row: Option<u32>,
    #[serde(default)]
    pub start_column: Option<String>,
    #[serde(default)]
    pub end_column: Option<String>,
}

impl Default for SheetRange {
    fn default() -> Self {
        Self {
            start_row: default_start_row(),
            header_row: None,
            end_row: None,
            start_column: None,
            end_column: None,
        }
    }
}

impl SheetRange {
    pub fn header_row(&self) -> u32 {
        self.header_row.unwrap_or(self.start_row)
    }
}

/// Spreadsheet locator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetSource {
    pub spreadsheet_id: String,
    pub sheet_name: String,
    #[serde(default)]
    pub range: SheetRange,
    /// Opaque reference resolved to an access token by the auth service
    pub credential_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Previously uploaded delimited file
    Csv { file_id: String },
    GoogleSheets(SheetSource),
}

impl SourceConfig {
    pub fn describe(&self) -> String {
        match self {
            SourceConfig::Csv { file_id } => format!("csv file {}", file_id),
            SourceConfig::GoogleSheets(sheet) => {
                format!("sheet '{}' of spreadsheet {}", sheet.sheet_name, sheet.spreadsheet_id)
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    #[default]
    Postgresql,
    /// Speaks the PostgreSQL protocol and shares its code path
    Redshift,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(default)]
    pub kind: DestinationKind,
    pub credential_id: i64,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
}

impl DestinationConfig {
    pub fn qualified_table(&self) -> String {
        qualified_name(&self.schema, &self.table)
    }
}

/// One destination column and how it is produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Absent for calculated columns
    #[serde(default)]
    pub source_column: Option<String>,
    pub destination_column: String,
    #[serde(default)]
    pub source_type: Option<DataType>,
    pub destination_type: DataType,
    #[serde(default)]
    pub transformations: Vec<String>,
    #[serde(default = "default_true")]
    pub is_nullable: bool,
    /// Substituted for nulls when the column is not nullable
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub exclude: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub calculated_expression: Option<String>,
    #[serde(default)]
    pub order: i32,
}

impl ColumnMapping {
    /// Plain source→destination mapping with default properties
    pub fn new(source: &str, destination: &str, destination_type: DataType) -> Self {
        Self {
            source_column: Some(source.to_string()),
            destination_column: destination.to_string(),
            source_type: None,
            destination_type,
            transformations: Vec::new(),
            is_nullable: true,
            default_value: None,
            exclude: false,
            is_primary_key: false,
            calculated_expression: None,
            order: 0,
        }
    }

    /// Column computed from an expression over other columns
    pub fn calculated(destination: &str, destination_type: DataType, expression: &str) -> Self {
        Self {
            source_column: None,
            calculated_expression: Some(expression.to_string()),
            ..Self::new("", destination, destination_type)
        }
    }

    pub fn is_calculated(&self) -> bool {
        self.calculated_expression.is_some()
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_transformations(mut self, transformations: &[&str]) -> Self {
        self.transformations = transformations.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.is_nullable = false;
        self
    }

    pub fn excluded(mut self) -> Self {
        self.exclude = true;
        self
    }

    pub fn not_null_with_default(mut self, default_value: &str) -> Self {
        self.is_nullable = false;
        self.default_value = Some(default_value.to_string());
        self
    }
}

/// Immutable-per-run job configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub load_strategy: LoadStrategy,
    #[serde(default)]
    pub upsert_keys: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub create_new_table: bool,
    #[serde(default)]
    pub table_ddl: Option<String>,
    pub column_mappings: Vec<ColumnMapping>,
}

impl JobDefinition {
    /// Non-excluded mappings sorted by `order` (stable for equal orders)
    pub fn active_mappings(&self) -> Vec<&ColumnMapping> {
        let mut mappings: Vec<&ColumnMapping> =
            self.column_mappings.iter().filter(|m| !m.exclude).collect();
        mappings.sort_by_key(|m| m.order);
        mappings
    }

    /// Destination column names the table is expected to have, in `order`
    pub fn expected_columns(&self) -> Vec<String> {
        self.active_mappings()
            .into_iter()
            .map(|m| m.destination_column.clone())
            .collect()
    }

    /// DDL to create the destination table when it is absent or must be
    /// recreated
    pub fn create_ddl(&self) -> Option<&str> {
        self.table_ddl
            .as_deref()
            .map(str::trim)
            .filter(|ddl| !ddl.is_empty())
    }

    /// Reject definitions that cannot run, before any destination is touched.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EngineError::InvalidJob("batch size must be positive".to_string()));
        }

        validate_identifier(&self.destination.schema, "schema")?;
        validate_identifier(&self.destination.table, "table")?;

        if self.column_mappings.is_empty() {
            return Err(EngineError::InvalidJob(
                "job has no column mappings".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for mapping in &self.column_mappings {
            validate_identifier(&mapping.destination_column, "column")?;
            if !seen.insert(mapping.destination_column.as_str()) {
                return Err(EngineError::InvalidJob(format!(
                    "destination column '{}' is mapped more than once",
                    mapping.destination_column
                )));
            }

            let has_source = mapping
                .source_column
                .as_deref()
                .is_some_and(|s| !s.is_empty());
            if !has_source && !mapping.is_calculated() {
                return Err(EngineError::InvalidJob(format!(
                    "column '{}' has neither a source column nor a calculated expression",
                    mapping.destination_column
                )));
            }
            if mapping
                .calculated_expression
                .as_deref()
                .is_some_and(|e| e.trim().is_empty())
            {
                return Err(EngineError::InvalidJob(format!(
                    "calculated column '{}' has an empty expression",
                    mapping.destination_column
                )));
            }
        }

        if self.active_mappings().is_empty() {
            return Err(EngineError::InvalidJob(
                "every column mapping is excluded".to_string(),
            ));
        }

        self.validate_upsert_keys()?;

        if self.create_new_table && self.create_ddl().is_none() {
            return Err(EngineError::NoDDLAvailable {
                table: self.destination.qualified_table(),
            });
        }

        Ok(())
    }

    fn validate_upsert_keys(&self) -> Result<()> {
        match self.load_strategy {
            LoadStrategy::Upsert => {
                if self.upsert_keys.is_empty() {
                    return Err(EngineError::InvalidJob(
                        "upsert strategy requires at least one upsert key".to_string(),
                    ));
                }
                let mut seen = HashSet::new();
                for key in &self.upsert_keys {
                    if !seen.insert(key.as_str()) {
                        return Err(EngineError::InvalidJob(format!(
                            "upsert key '{}' is listed more than once",
                            key
                        )));
                    }
                    let mapping = self
                        .column_mappings
                        .iter()
                        .find(|m| &m.destination_column == key)
                        .ok_or_else(|| {
                            EngineError::InvalidJob(format!(
                                "upsert key '{}' does not match any destination column",
                                key
                            ))
                        })?;
                    if mapping.exclude {
                        return Err(EngineError::InvalidJob(format!(
                            "upsert key '{}' refers to an excluded column",
                            key
                        )));
                    }
                    if !mapping.is_primary_key {
                        return Err(EngineError::InvalidJob(format!(
                            "upsert key '{}' must be declared as a primary key column",
                            key
                        )));
                    }
                }
                Ok(())
            },
            LoadStrategy::Insert | LoadStrategy::TruncateInsert => {
                if self.upsert_keys.is_empty() {
                    Ok(())
                } else {
                    Err(EngineError::InvalidJob(format!(
                        "upsert keys are only allowed with the upsert strategy (got {})",
                        self.load_strategy
                    )))
                }
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn job(strategy: LoadStrategy, keys: &[&str]) -> JobDefinition {
        JobDefinition {
            id: 1,
            name: "orders".to_string(),
            source: SourceConfig::Csv {
                file_id: "f1".to_string(),
            },
            destination: DestinationConfig {
                kind: DestinationKind::Postgresql,
                credential_id: 1,
                schema: "public".to_string(),
                table: "orders".to_string(),
            },
            load_strategy: strategy,
            upsert_keys: keys.iter().map(|k| k.to_string()).collect(),
            batch_size: DEFAULT_BATCH_SIZE,
            create_new_table: false,
            table_ddl: None,
            column_mappings: vec![
                ColumnMapping::new("id", "id", DataType::Integer).primary_key(),
                ColumnMapping::new("name", "full_name", DataType::Text).with_order(1),
                ColumnMapping::new("amt", "amt", DataType::Numeric)
                    .with_order(2)
                    .excluded(),
            ],
        }
    }

    #[test]
    fn test_valid_jobs() {
        assert!(job(LoadStrategy::Insert, &[]).validate().is_ok());
        assert!(job(LoadStrategy::Upsert, &["id"]).validate().is_ok());
    }

    #[test]
    fn test_upsert_requires_keys() {
        let err = job(LoadStrategy::Upsert, &[]).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_upsert_key_must_be_primary_key() {
        let err = job(LoadStrategy::Upsert, &["full_name"]).validate().unwrap_err();
        assert!(err.to_string().contains("'full_name' must be declared as a primary key"));
    }

    #[test]
    fn test_upsert_key_must_not_be_excluded() {
        let mut j = job(LoadStrategy::Upsert, &["amt"]);
        j.column_mappings[2].is_primary_key = true;
        assert!(j.validate().unwrap_err().to_string().contains("excluded"));
    }

    #[test]
    fn test_keys_rejected_for_insert() {
        assert!(job(LoadStrategy::Insert, &["id"]).validate().is_err());
    }

    #[test]
    fn test_duplicate_destination_column() {
        let mut j = job(LoadStrategy::Insert, &[]);
        j.column_mappings[1].destination_column = "id".to_string();
        assert!(j.validate().unwrap_err().to_string().contains("more than once"));
    }

    #[test]
    fn test_create_new_table_requires_ddl() {
        let mut j = job(LoadStrategy::Insert, &[]);
        j.create_new_table = true;
        j.table_ddl = Some("   ".to_string());
        assert!(matches!(
            j.validate().unwrap_err(),
            EngineError::NoDDLAvailable { .. }
        ));
    }

    #[test]
    fn test_active_mappings_follow_order() {
        let mut j = job(LoadStrategy::Insert, &[]);
        j.column_mappings[0].order = 5;
        assert_eq!(j.expected_columns(), vec!["full_name", "id"]);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let raw = serde_json::json!({
            "id": 3,
            "source": {"kind": "csv", "file_id": "abc"},
            "destination": {"credential_id": 9, "table": "people"},
            "column_mappings": [
                {"source_column": "n", "destination_column": "name", "destination_type": "text"}
            ]
        });
        let j: JobDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(j.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(j.load_strategy, LoadStrategy::Insert);
        assert_eq!(j.destination.schema, "public");
        assert!(j.column_mappings[0].is_nullable);
        assert!(j.validate().is_ok());
    }

    #[test]
    fn test_sheet_source_deserializes() {
        let raw = serde_json::json!({
            "kind": "google_sheets",
            "spreadsheet_id": "sp1",
            "sheet_name": "Data",
            "range": {"start_row": 3, "end_row": 40},
            "credential_id": 2
        });
        let source: SourceConfig = serde_json::from_value(raw).unwrap();
        match source {
            SourceConfig::GoogleSheets(sheet) => {
                assert_eq!(sheet.range.header_row(), 3);
                assert_eq!(sheet.range.end_row, Some(40));
            },
            other => panic!("unexpected source {:?}", other),
        }
    }
}

//! CREATE TABLE generation from column mappings

use std::sync::Arc;

use etl_common::identifier::{qualified_name, quote_ident, quoted_list, validate_identifier};

use super::types::{NativeFamily, TypeRegistry};
use crate::batch::{parse_bool_token, parse_timestamp};
use crate::destination::{CREATED_AT, UPDATED_AT};
use crate::error::{EngineError, Result};
use crate::models::ColumnMapping;

const AUDIT_COLUMN_DEF: &str = "TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL";

#[derive(Debug, Clone)]
pub struct DdlGenerator {
    types: Arc<TypeRegistry>,
}

impl DdlGenerator {
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        Self { types }
    }

    /// `CREATE TABLE` for the non-excluded mappings in `order`, plus the
    /// audit columns and a primary key over the primary-key mappings.
    pub fn generate(&self, schema: &str, table: &str, mappings: &[ColumnMapping]) -> Result<String> {
        validate_identifier(schema, "schema")?;
        validate_identifier(table, "table")?;

        let mut active: Vec<&ColumnMapping> = mappings.iter().filter(|m| !m.exclude).collect();
        active.sort_by_key(|m| m.order);
        if active.is_empty() {
            return Err(EngineError::InvalidJob(format!(
                "cannot generate DDL for {}.{}: no columns",
                schema, table
            )));
        }

        let mut lines = Vec::with_capacity(active.len() + 3);
        for mapping in &active {
            validate_identifier(&mapping.destination_column, "column")?;
            lines.push(self.column_definition(mapping)?);
        }

        for audit in [CREATED_AT, UPDATED_AT] {
            if !active.iter().any(|m| m.destination_column == audit) {
                lines.push(format!("{} {}", quote_ident(audit), AUDIT_COLUMN_DEF));
            }
        }

        let primary_key: Vec<&str> = active
            .iter()
            .filter(|m| m.is_primary_key)
            .map(|m| m.destination_column.as_str())
            .collect();
        if !primary_key.is_empty() {
            lines.push(format!("PRIMARY KEY ({})", quoted_list(&primary_key)));
        }

        Ok(format!(
            "CREATE TABLE {} (\n    {}\n);",
            qualified_name(schema, table),
            lines.join(",\n    ")
        ))
    }

    fn column_definition(&self, mapping: &ColumnMapping) -> Result<String> {
        let native = self.types.ddl_type(mapping.destination_type);
        let mut def = format!("{} {}", quote_ident(&mapping.destination_column), native);

        if !mapping.is_nullable || mapping.is_primary_key {
            def.push_str(" NOT NULL");
        }

        if let Some(default) = mapping.default_value.as_deref().filter(|d| !d.is_empty()) {
            let literal = self
                .default_literal(native, default)
                .ok_or_else(|| {
                    EngineError::InvalidJob(format!(
                        "default value '{}' is not a valid {} for column '{}'",
                        default, native, mapping.destination_column
                    ))
                })?;
            def.push_str(" DEFAULT ");
            def.push_str(&literal);
        }

        Ok(def)
    }

    /// SQL literal for a default value, or `None` if it does not fit.
    fn default_literal(&self, native: &str, raw: &str) -> Option<String> {
        let quoted = || format!("'{}'", raw.replace('\'', "''"));
        match self.types.family(native) {
            NativeFamily::Integer => raw.trim().parse::<i64>().ok().map(|i| i.to_string()),
            NativeFamily::Numeric => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|_| raw.trim().to_string()),
            NativeFamily::Boolean => {
                parse_bool_token(raw).map(|b| if b { "TRUE" } else { "FALSE" }.to_string())
            },
            NativeFamily::Timestamp => parse_timestamp(raw).map(|_| quoted()),
            NativeFamily::Text | NativeFamily::Other => Some(quoted()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::batch::DataType;

    fn generator() -> DdlGenerator {
        DdlGenerator::new(Arc::new(TypeRegistry::postgres()))
    }

    #[test]
    fn test_generate() {
        let mappings = vec![
            ColumnMapping::new("name", "full_name", DataType::Text)
                .with_order(2)
                .not_null_with_default("O'Brien"),
            ColumnMapping::new("id", "id", DataType::Integer).primary_key(),
            ColumnMapping::new("amt", "amt", DataType::Numeric).excluded(),
            ColumnMapping::new("ok", "ok", DataType::Boolean)
                .with_order(3)
                .not_null_with_default("yes"),
        ];
        let ddl = generator().generate("public", "orders", &mappings).unwrap();
        assert_eq!(
            ddl,
            "CREATE TABLE \"public\".\"orders\" (\n    \
             \"id\" BIGINT NOT NULL,\n    \
             \"full_name\" TEXT NOT NULL DEFAULT 'O''Brien',\n    \
             \"ok\" BOOLEAN NOT NULL DEFAULT TRUE,\n    \
             \"created_at\" TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL,\n    \
             \"updated_at\" TIMESTAMP DEFAULT CURRENT_TIMESTAMP NOT NULL,\n    \
             PRIMARY KEY (\"id\")\n);"
        );
    }

    #[test]
    fn test_invalid_default() {
        let mappings =
            vec![ColumnMapping::new("n", "n", DataType::Integer).not_null_with_default("many")];
        assert!(generator().generate("public", "t", &mappings).is_err());
    }

    #[test]
    fn test_invalid_identifiers() {
        let mappings = vec![ColumnMapping::new("n", "n", DataType::Integer)];
        assert!(generator().generate("public", "drop", &mappings).is_err());
        assert!(generator().generate("1abc", "t", &mappings).is_err());
    }

    #[test]
    fn test_custom_type_registry() {
        let types = TypeRegistry::postgres().with_ddl_type(DataType::Text, "VARCHAR(255)");
        let ddl = DdlGenerator::new(Arc::new(types))
            .generate("public", "t", &[ColumnMapping::new("n", "n", DataType::Text)])
            .unwrap();
        assert!(ddl.contains("\"n\" VARCHAR(255),"));
    }
}

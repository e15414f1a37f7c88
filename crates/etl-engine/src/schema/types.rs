//! Mapping between semantic types and destination-native types

use std::collections::HashMap;

use crate::batch::DataType;

/// Broad class of a destination-native column type. Decides how values are
/// converted and bound before they are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeFamily {
    Text,
    Integer,
    Numeric,
    Boolean,
    Timestamp,
    /// Anything else (json, uuid, time, ...): written as text and cast by the
    /// destination
    Other,
}

impl NativeFamily {
    /// Semantic type values must have before they are bound
    pub fn data_type(&self) -> DataType {
        match self {
            NativeFamily::Text | NativeFamily::Other => DataType::Text,
            NativeFamily::Integer => DataType::Integer,
            NativeFamily::Numeric => DataType::Numeric,
            NativeFamily::Boolean => DataType::Boolean,
            NativeFamily::Timestamp => DataType::Timestamp,
        }
    }
}

const TEXT_TYPES: &[&str] = &[
    "text",
    "character varying",
    "varchar",
    "character",
    "char",
    "bpchar",
    "citext",
    "name",
];
const INTEGER_TYPES: &[&str] = &[
    "smallint",
    "integer",
    "bigint",
    "int",
    "int2",
    "int4",
    "int8",
    "smallserial",
    "serial",
    "bigserial",
];
const NUMERIC_TYPES: &[&str] = &[
    "numeric",
    "decimal",
    "real",
    "double precision",
    "float",
    "float4",
    "float8",
];
const BOOLEAN_TYPES: &[&str] = &["boolean", "bool"];

/// Immutable type table handed to the DDL generator, the reconciler and the
/// loader.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    ddl: HashMap<DataType, String>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::postgres()
    }
}

impl TypeRegistry {
    /// PostgreSQL/Redshift column types
    pub fn postgres() -> Self {
        let ddl = [
            (DataType::Text, "TEXT"),
            (DataType::Integer, "BIGINT"),
            (DataType::Numeric, "NUMERIC"),
            (DataType::Boolean, "BOOLEAN"),
            (DataType::Timestamp, "TIMESTAMP"),
        ]
        .into_iter()
        .map(|(t, s)| (t, s.to_string()))
        .collect();
        Self { ddl }
    }

    /// Override the DDL type emitted for `data_type`.
    pub fn with_ddl_type(mut self, data_type: DataType, ddl_type: impl Into<String>) -> Self {
        self.ddl.insert(data_type, ddl_type.into());
        self
    }

    pub fn ddl_type(&self, data_type: DataType) -> &str {
        self.ddl.get(&data_type).map(String::as_str).unwrap_or("TEXT")
    }

    /// Classify a native type name such as `character varying(255)` or
    /// `timestamp without time zone`.
    pub fn family(&self, native_type: &str) -> NativeFamily {
        let lower = native_type.trim().to_lowercase();
        let base = lower.split('(').next().unwrap_or_default().trim();

        if TEXT_TYPES.contains(&base) {
            NativeFamily::Text
        } else if INTEGER_TYPES.contains(&base) {
            NativeFamily::Integer
        } else if NUMERIC_TYPES.contains(&base) {
            NativeFamily::Numeric
        } else if BOOLEAN_TYPES.contains(&base) {
            NativeFamily::Boolean
        } else if base.starts_with("timestamp") || base == "date" {
            NativeFamily::Timestamp
        } else {
            NativeFamily::Other
        }
    }
}

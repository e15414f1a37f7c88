//! Typed cell values and semantic type tags

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Semantic column type shared by sources, mappings and the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "string", alias = "TEXT", alias = "VARCHAR", alias = "CHAR")]
    Text,
    #[serde(alias = "int", alias = "INTEGER", alias = "BIGINT", alias = "SMALLINT")]
    Integer,
    #[serde(
        alias = "number",
        alias = "float",
        alias = "NUMERIC",
        alias = "DECIMAL",
        alias = "FLOAT",
        alias = "DOUBLE"
    )]
    Numeric,
    #[serde(alias = "bool", alias = "BOOLEAN")]
    Boolean,
    #[serde(
        alias = "date",
        alias = "datetime",
        alias = "TIMESTAMP",
        alias = "DATE",
        alias = "DATETIME"
    )]
    Timestamp,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Text => "text",
            DataType::Integer => "integer",
            DataType::Numeric => "numeric",
            DataType::Boolean => "boolean",
            DataType::Timestamp => "timestamp",
        }
    }

    /// Parse a loose type tag ("VARCHAR(40)", "number", "datetime", ...)
    pub fn from_tag(tag: &str) -> Option<DataType> {
        let upper = tag.trim().to_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "TEXT" | "STRING" | "VARCHAR" | "CHAR" | "CHARACTER VARYING" => Some(DataType::Text),
            "INTEGER" | "INT" | "BIGINT" | "SMALLINT" => Some(DataType::Integer),
            "NUMERIC" | "NUMBER" | "DECIMAL" | "FLOAT" | "DOUBLE" | "REAL" => {
                Some(DataType::Numeric)
            },
            "BOOLEAN" | "BOOL" => Some(DataType::Boolean),
            "TIMESTAMP" | "TIMESTAMPTZ" | "DATE" | "DATETIME" => Some(DataType::Timestamp),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single nullable cell
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Numeric(f64),
    Boolean(bool),
    Timestamp(NaiveDateTime),
}

/// Tokens accepted as booleans by inference and coercion
pub const BOOLEAN_TOKENS: &[&str] = &["true", "false", "1", "0", "yes", "no", "t", "f", "y", "n"];

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y", "%Y%m%d"];

pub fn parse_bool_token(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "t" | "y" => Some(true),
        "false" | "0" | "no" | "f" | "n" => Some(false),
        _ => None,
    }
}

/// Best-effort timestamp parsing over the common textual layouts
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in TIMESTAMP_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Text(_) => Some(DataType::Text),
            Value::Integer(_) => Some(DataType::Integer),
            Value::Numeric(_) => Some(DataType::Numeric),
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Timestamp(_) => Some(DataType::Timestamp),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Numeric(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text rendering used by `str()`, text coercion and default values
    pub fn render(&self) -> Option<String> {
        match self {
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Convert to `target`, or describe why the value does not fit.
    pub fn coerce(&self, target: DataType) -> std::result::Result<Value, String> {
        if self.is_null() || self.data_type() == Some(target) {
            return Ok(self.clone());
        }

        match (target, self) {
            (DataType::Text, v) => Ok(Value::Text(v.to_string())),

            (DataType::Integer, Value::Numeric(n)) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < i64::MAX as f64 {
                    Ok(Value::Integer(*n as i64))
                } else {
                    Err(format!("{} is not a whole number", n))
                }
            },
            (DataType::Integer, Value::Boolean(b)) => Ok(Value::Integer(i64::from(*b))),
            (DataType::Integer, Value::Text(s)) => {
                let t = s.trim();
                if t.is_empty() {
                    return Ok(Value::Null);
                }
                if let Ok(i) = t.parse::<i64>() {
                    return Ok(Value::Integer(i));
                }
                match t.parse::<f64>() {
                    Ok(f) => Value::Numeric(f).coerce(DataType::Integer),
                    Err(_) => Err(format!("'{}' is not an integer", s)),
                }
            },

            (DataType::Numeric, Value::Integer(i)) => Ok(Value::Numeric(*i as f64)),
            (DataType::Numeric, Value::Boolean(b)) => Ok(Value::Numeric(if *b { 1.0 } else { 0.0 })),
            (DataType::Numeric, Value::Text(s)) => {
                let t = s.trim();
                if t.is_empty() {
                    return Ok(Value::Null);
                }
                t.parse::<f64>()
                    .map(Value::Numeric)
                    .map_err(|_| format!("'{}' is not a number", s))
            },

            (DataType::Boolean, Value::Integer(i)) => match i {
                0 => Ok(Value::Boolean(false)),
                1 => Ok(Value::Boolean(true)),
                _ => Err(format!("{} is not a boolean", i)),
            },
            (DataType::Boolean, Value::Numeric(n)) => {
                if *n == 0.0 {
                    Ok(Value::Boolean(false))
                } else if *n == 1.0 {
                    Ok(Value::Boolean(true))
                } else {
                    Err(format!("{} is not a boolean", n))
                }
            },
            (DataType::Boolean, Value::Text(s)) => {
                if s.trim().is_empty() {
                    return Ok(Value::Null);
                }
                parse_bool_token(s)
                    .map(Value::Boolean)
                    .ok_or_else(|| format!("'{}' is not a boolean", s))
            },

            (DataType::Timestamp, Value::Text(s)) => {
                if s.trim().is_empty() {
                    return Ok(Value::Null);
                }
                parse_timestamp(s)
                    .map(Value::Timestamp)
                    .ok_or_else(|| format!("'{}' is not a timestamp", s))
            },

            (target, v) => Err(format!("cannot convert {} to {}", v, target)),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Text(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Numeric(n) => write!(f, "{}", n),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_type_tags() {
        assert_eq!(DataType::from_tag("VARCHAR(255)"), Some(DataType::Text));
        assert_eq!(DataType::from_tag("number"), Some(DataType::Numeric));
        assert_eq!(DataType::from_tag("DECIMAL(18,2)"), Some(DataType::Numeric));
        assert_eq!(DataType::from_tag("datetime"), Some(DataType::Timestamp));
        assert_eq!(DataType::from_tag("JSONB"), None);
    }

    #[test]
    fn test_serde_aliases() {
        let t: DataType = serde_json::from_str("\"INTEGER\"").unwrap();
        assert_eq!(t, DataType::Integer);
        let t: DataType = serde_json::from_str("\"number\"").unwrap();
        assert_eq!(t, DataType::Numeric);
    }

    #[test]
    fn test_text_to_numbers() {
        assert_eq!(
            Value::Text(" 42 ".into()).coerce(DataType::Integer).unwrap(),
            Value::Integer(42)
        );
        assert_eq!(
            Value::Text("3.0".into()).coerce(DataType::Integer).unwrap(),
            Value::Integer(3)
        );
        assert!(Value::Text("3.5".into()).coerce(DataType::Integer).is_err());
        assert_eq!(
            Value::Text("2.5".into()).coerce(DataType::Numeric).unwrap(),
            Value::Numeric(2.5)
        );
        assert!(Value::Text("abc".into()).coerce(DataType::Numeric).is_err());
    }

    #[test]
    fn test_blank_text_becomes_null_for_typed_targets() {
        assert_eq!(Value::Text("".into()).coerce(DataType::Integer).unwrap(), Value::Null);
        assert_eq!(Value::Text(" ".into()).coerce(DataType::Boolean).unwrap(), Value::Null);
        assert_eq!(
            Value::Text("".into()).coerce(DataType::Text).unwrap(),
            Value::Text("".into())
        );
    }

    #[test]
    fn test_booleans() {
        assert_eq!(
            Value::Text("Yes".into()).coerce(DataType::Boolean).unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(Value::Integer(0).coerce(DataType::Boolean).unwrap(), Value::Boolean(false));
        assert!(Value::Integer(7).coerce(DataType::Boolean).is_err());
    }

    #[test]
    fn test_timestamps() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2024-03-09"), Some(expected));
        assert_eq!(parse_timestamp("03/09/2024"), Some(expected));
        assert!(parse_timestamp("2024-03-09T10:15:00Z").is_some());
        assert!(parse_timestamp("2024-03-09 10:15:00.250").is_some());
        assert!(parse_timestamp("next tuesday").is_none());
    }

    #[test]
    fn test_render() {
        assert_eq!(Value::Null.render(), None);
        assert_eq!(Value::Numeric(2.5).render().unwrap(), "2.5");
        assert_eq!(Value::Boolean(true).render().unwrap(), "true");

        let ts = parse_timestamp("2024-03-01 10:15:30.250").unwrap();
        assert_eq!(
            Value::Timestamp(ts).coerce(DataType::Text).unwrap(),
            Value::Text("2024-03-01 10:15:30.250".into())
        );
        let whole = parse_timestamp("2024-03-01 10:15:30").unwrap();
        assert_eq!(Value::Timestamp(whole).to_string(), "2024-03-01 10:15:30");
    }
}

//! Named column transformations

use chrono::{Datelike, NaiveTime, Utc};
use serde::Serialize;

use crate::batch::{parse_timestamp, Column, DataType, Value};
use crate::error::{EngineError, Result};

/// A pure column→column function
pub type TransformFn = fn(&Column) -> Column;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformCategory {
    String,
    Date,
    Numeric,
    NullHandling,
}

impl TransformCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformCategory::String => "string",
            TransformCategory::Date => "date",
            TransformCategory::Numeric => "numeric",
            TransformCategory::NullHandling => "null_handling",
        }
    }
}

#[derive(Clone, Serialize)]
pub struct TransformSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub category: TransformCategory,
    #[serde(skip)]
    pub apply: TransformFn,
}

impl std::fmt::Debug for TransformSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformSpec")
            .field("name", &self.name)
            .field("category", &self.category)
            .finish()
    }
}

/// Immutable catalogue of transformations, handed to the transform engine.
///
/// `none` and the empty string always mean identity and are not listed.
#[derive(Debug, Clone, Default)]
pub struct TransformRegistry {
    entries: Vec<TransformSpec>,
}

impl TransformRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in transformation
    pub fn builtin() -> Self {
        use TransformCategory as C;
        let specs: [(&'static str, &'static str, TransformCategory, TransformFn); 20] = [
            ("UPPER", "Convert text to UPPERCASE", C::String, upper),
            ("LOWER", "Convert text to lowercase", C::String, lower),
            ("TRIM", "Remove leading and trailing whitespace", C::String, trim),
            ("LTRIM", "Remove leading whitespace", C::String, ltrim),
            ("RTRIM", "Remove trailing whitespace", C::String, rtrim),
            ("REMOVE_SPACES", "Remove all spaces from text", C::String, remove_spaces),
            ("CAPITALIZE", "Capitalize first letter of each value", C::String, capitalize),
            ("TITLE", "Convert To Title Case", C::String, title),
            ("REVERSE", "Reverse text", C::String, reverse),
            ("LENGTH", "Get length of text", C::String, length),
            ("EXTRACT_YEAR", "Extract year from date (e.g., 2024)", C::Date, extract_year),
            ("EXTRACT_MONTH", "Extract month number (1-12)", C::Date, extract_month),
            ("EXTRACT_DAY", "Extract day of month (1-31)", C::Date, extract_day),
            ("TODAY", "Replace with current date", C::Date, today),
            ("NOW", "Replace with current date and time", C::Date, now),
            ("ABS", "Get absolute value", C::Numeric, abs),
            ("FLOOR", "Round down to nearest integer", C::Numeric, floor),
            ("CEILING", "Round up to nearest integer", C::Numeric, ceiling),
            ("FILL_NULL", "Replace null values with empty string", C::NullHandling, fill_null),
            ("FILL_ZERO", "Replace null values with zero", C::NullHandling, fill_zero),
        ];
        specs
            .into_iter()
            .fold(Self::empty(), |reg, (name, description, category, apply)| {
                reg.with(TransformSpec {
                    name,
                    description,
                    category,
                    apply,
                })
            })
    }

    /// Add or replace an entry.
    pub fn with(mut self, spec: TransformSpec) -> Self {
        self.entries.retain(|e| e.name != spec.name);
        self.entries.push(spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TransformSpec> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[TransformSpec] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    pub fn is_identity(name: &str) -> bool {
        let name = name.trim();
        name.is_empty() || name.eq_ignore_ascii_case("none")
    }

    /// Check that `name` resolves, without applying it.
    pub fn check(&self, name: &str) -> Result<()> {
        if Self::is_identity(name) || self.get(name.trim()).is_some() {
            Ok(())
        } else {
            Err(self.unknown(name))
        }
    }

    pub fn apply(&self, column: &Column, name: &str) -> Result<Column> {
        if Self::is_identity(name) {
            return Ok(column.clone());
        }
        let spec = self.get(name.trim()).ok_or_else(|| self.unknown(name))?;
        Ok((spec.apply)(column))
    }

    /// Apply `names` left to right.
    pub fn apply_all(&self, column: Column, names: &[String]) -> Result<Column> {
        names
            .iter()
            .try_fold(column, |col, name| self.apply(&col, name))
    }

    fn unknown(&self, name: &str) -> EngineError {
        EngineError::UnknownTransformation {
            name: name.to_string(),
            available: self.names().join(", "),
        }
    }
}

// ============================================================================
// Built-in transformations
// ============================================================================

/// Map text cells; non-text columns pass through unchanged.
fn map_text(column: &Column, f: impl Fn(&str) -> String) -> Column {
    if column.data_type != DataType::Text {
        return column.clone();
    }
    let values = column
        .values
        .iter()
        .map(|v| match v {
            Value::Text(s) => Value::Text(f(s)),
            other => other.clone(),
        })
        .collect();
    Column::new(column.name.clone(), DataType::Text, values)
}

fn upper(c: &Column) -> Column {
    map_text(c, str::to_uppercase)
}

fn lower(c: &Column) -> Column {
    map_text(c, str::to_lowercase)
}

fn trim(c: &Column) -> Column {
    map_text(c, |s| s.trim().to_string())
}

fn ltrim(c: &Column) -> Column {
    map_text(c, |s| s.trim_start().to_string())
}

fn rtrim(c: &Column) -> Column {
    map_text(c, |s| s.trim_end().to_string())
}

fn remove_spaces(c: &Column) -> Column {
    map_text(c, |s| s.replace(' ', ""))
}

fn capitalize(c: &Column) -> Column {
    map_text(c, |s| {
        let mut chars = s.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
            None => String::new(),
        }
    })
}

fn title(c: &Column) -> Column {
    map_text(c, |s| {
        let mut out = String::with_capacity(s.len());
        let mut prev_alpha = false;
        for ch in s.chars() {
            if prev_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            prev_alpha = ch.is_alphabetic();
        }
        out
    })
}

fn reverse(c: &Column) -> Column {
    map_text(c, |s| s.chars().rev().collect())
}

fn length(c: &Column) -> Column {
    if c.data_type != DataType::Text {
        return c.clone();
    }
    let values = c
        .values
        .iter()
        .map(|v| match v {
            Value::Text(s) => Value::Integer(s.chars().count() as i64),
            _ => Value::Null,
        })
        .collect();
    Column::new(c.name.clone(), DataType::Integer, values)
}

fn extract(c: &Column, part: fn(&chrono::NaiveDateTime) -> i64) -> Column {
    let values = c
        .values
        .iter()
        .map(|v| {
            let ts = match v {
                Value::Timestamp(ts) => Some(*ts),
                Value::Text(s) => parse_timestamp(s),
                _ => None,
            };
            ts.map(|t| Value::Integer(part(&t))).unwrap_or(Value::Null)
        })
        .collect();
    Column::new(c.name.clone(), DataType::Integer, values)
}

fn extract_year(c: &Column) -> Column {
    extract(c, |t| i64::from(t.year()))
}

fn extract_month(c: &Column) -> Column {
    extract(c, |t| i64::from(t.month()))
}

fn extract_day(c: &Column) -> Column {
    extract(c, |t| i64::from(t.day()))
}

fn constant(c: &Column, value: Value) -> Column {
    let data_type = value.data_type().unwrap_or(DataType::Text);
    Column::new(c.name.clone(), data_type, vec![value; c.len()])
}

fn today(c: &Column) -> Column {
    let midnight = Utc::now().date_naive().and_time(NaiveTime::default());
    constant(c, Value::Timestamp(midnight))
}

fn now(c: &Column) -> Column {
    constant(c, Value::Timestamp(Utc::now().naive_utc()))
}

fn abs(c: &Column) -> Column {
    let values = c
        .values
        .iter()
        .map(|v| match v {
            Value::Integer(i) => Value::Integer(i.saturating_abs()),
            Value::Numeric(n) => Value::Numeric(n.abs()),
            other => other.clone(),
        })
        .collect();
    Column::new(c.name.clone(), c.data_type, values)
}

fn round_with(c: &Column, f: fn(f64) -> f64) -> Column {
    if c.data_type != DataType::Numeric {
        return c.clone();
    }
    let values = c
        .values
        .iter()
        .map(|v| match v {
            Value::Numeric(n) if n.is_finite() => Value::Integer(f(*n) as i64),
            Value::Numeric(_) => Value::Null,
            other => other.clone(),
        })
        .collect();
    Column::new(c.name.clone(), DataType::Integer, values)
}

fn floor(c: &Column) -> Column {
    round_with(c, f64::floor)
}

fn ceiling(c: &Column) -> Column {
    round_with(c, f64::ceil)
}

fn fill_null(c: &Column) -> Column {
    let values = c
        .values
        .iter()
        .map(|v| match v {
            Value::Null => Value::Text(String::new()),
            Value::Text(s) => Value::Text(s.clone()),
            other => Value::Text(other.to_string()),
        })
        .collect();
    Column::new(c.name.clone(), DataType::Text, values)
}

fn fill_zero(c: &Column) -> Column {
    let zero = match c.data_type {
        DataType::Integer => Value::Integer(0),
        DataType::Numeric => Value::Numeric(0.0),
        DataType::Text => Value::Text("0".to_string()),
        DataType::Boolean => Value::Boolean(false),
        DataType::Timestamp => return c.clone(),
    };
    let values = c
        .values
        .iter()
        .map(|v| if v.is_null() { zero.clone() } else { v.clone() })
        .collect();
    Column::new(c.name.clone(), c.data_type, values)
}

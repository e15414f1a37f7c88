//! Column type inference for textual sources

use std::collections::HashSet;

use crate::batch::{parse_bool_token, parse_timestamp, Column, DataType, Value, BOOLEAN_TOKENS};

/// Cells read as null regardless of column type
pub const NULL_TOKENS: &[&str] = &["", "NA", "N/A", "NULL", "null", "NaN", "nan", "#N/A"];

/// Rows sampled when testing for timestamps
const TIMESTAMP_SAMPLE: usize = 100;

pub fn is_null_token(cell: &str) -> bool {
    let trimmed = cell.trim();
    NULL_TOKENS.contains(&trimmed)
}

/// Turn raw text cells into a typed column. Candidates are tested in order
/// boolean, numeric, timestamp, text; the first that fits wins.
pub fn infer_column(name: &str, cells: Vec<Option<String>>) -> Column {
    let non_null: Vec<&str> = cells.iter().flatten().map(|s| s.trim()).collect();

    if non_null.is_empty() {
        return text_column(name, cells);
    }

    if looks_boolean(&non_null) {
        return match typed(name, DataType::Boolean, &cells, |s| {
            parse_bool_token(s).map(Value::Boolean)
        }) {
            Some(col) => col.with_source_text(cells),
            None => text_column(name, cells),
        };
    }

    if non_null.iter().all(|s| s.parse::<i64>().is_ok()) {
        if let Some(col) = typed(name, DataType::Integer, &cells, |s| {
            s.trim().parse::<i64>().ok().map(Value::Integer)
        }) {
            return col;
        }
    }

    if non_null.iter().all(|s| is_number(s)) {
        if let Some(col) = typed(name, DataType::Numeric, &cells, |s| {
            s.trim().parse::<f64>().ok().map(Value::Numeric)
        }) {
            return col;
        }
    }

    let sample_parses = non_null
        .iter()
        .take(TIMESTAMP_SAMPLE)
        .all(|s| parse_timestamp(s).is_some());
    if sample_parses {
        // The sample decides the candidate; a later unparseable cell keeps the
        // whole column as text.
        if let Some(col) = typed(name, DataType::Timestamp, &cells, |s| {
            parse_timestamp(s).map(Value::Timestamp)
        }) {
            return col;
        }
    }

    text_column(name, cells)
}

fn looks_boolean(non_null: &[&str]) -> bool {
    let distinct: HashSet<String> = non_null.iter().map(|s| s.to_lowercase()).collect();
    distinct.len() <= 2 && distinct.iter().all(|v| BOOLEAN_TOKENS.contains(&v.as_str()))
}

fn is_number(s: &str) -> bool {
    // Rust accepts "inf"/"infinity" as floats; spreadsheets do not mean that
    let lower = s.to_lowercase();
    !lower.contains("inf") && s.parse::<f64>().is_ok()
}

fn typed<F>(name: &str, data_type: DataType, cells: &[Option<String>], parse: F) -> Option<Column>
where
    F: Fn(&str) -> Option<Value>,
{
    let values = cells
        .iter()
        .map(|cell| match cell {
            None => Some(Value::Null),
            Some(s) => parse(s),
        })
        .collect::<Option<Vec<_>>>()?;
    Some(Column::new(name, data_type, values))
}

fn text_column(name: &str, cells: Vec<Option<String>>) -> Column {
    Column::new(
        name,
        DataType::Text,
        cells
            .into_iter()
            .map(|c| c.map(Value::Text).unwrap_or(Value::Null))
            .collect(),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn cells(raw: &[&str]) -> Vec<Option<String>> {
        raw.iter()
            .map(|s| {
                if is_null_token(s) {
                    None
                } else {
                    Some(s.to_string())
                }
            })
            .collect()
    }

    #[test]
    fn test_boolean_first() {
        let col = infer_column("flag", cells(&["Yes", "no", "", "YES"]));
        assert_eq!(col.data_type, DataType::Boolean);
        assert_eq!(col.values[0], Value::Boolean(true));
        assert_eq!(col.values[2], Value::Null);
    }

    #[test]
    fn test_boolean_keeps_source_tokens() {
        let col = infer_column("code", cells(&["1", "0", ""]));
        assert_eq!(col.data_type, DataType::Boolean);
        assert_eq!(
            col.source_text().unwrap(),
            &[Some("1".to_string()), Some("0".to_string()), None]
        );
    }

    #[test]
    fn test_three_distinct_tokens_is_not_boolean() {
        let col = infer_column("x", cells(&["y", "n", "t"]));
        assert_eq!(col.data_type, DataType::Text);
    }

    #[test]
    fn test_numeric() {
        assert_eq!(infer_column("id", cells(&["1", "2", "3"])).data_type, DataType::Integer);
        let col = infer_column("amt", cells(&["1.5", "2", "NA"]));
        assert_eq!(col.data_type, DataType::Numeric);
        assert_eq!(col.values[1], Value::Numeric(2.0));
        assert_eq!(col.values[2], Value::Null);
    }

    #[test]
    fn test_infinity_is_text() {
        assert_eq!(infer_column("x", cells(&["inf", "2", "3"])).data_type, DataType::Text);
    }

    #[test]
    fn test_timestamp() {
        let col = infer_column("d", cells(&["2024-01-01", "2024-02-03 10:00:00"]));
        assert_eq!(col.data_type, DataType::Timestamp);
    }

    #[test]
    fn test_text_fallback() {
        let col = infer_column("name", cells(&["Ada", "Grace"]));
        assert_eq!(col.data_type, DataType::Text);
        assert_eq!(col.values[1], Value::Text("Grace".into()));
    }

    #[test]
    fn test_all_null_is_text() {
        let col = infer_column("empty", cells(&["", "NULL"]));
        assert_eq!(col.data_type, DataType::Text);
        assert_eq!(col.null_count(), 2);
    }
}

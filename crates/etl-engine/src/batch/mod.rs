//! In-memory columnar table passed between pipeline stages
//!
//! A [`TabularBatch`] is an ordered list of named columns that all have the
//! same length. Sources build one, the transform engine reshapes it, and from
//! the loader onward it is only read.

mod value;

pub use value::{parse_bool_token, parse_timestamp, DataType, Value, BOOLEAN_TOKENS};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub values: Vec<Value>,
    /// Cells as the source spelled them, for inferred types that do not keep
    /// the spelling (booleans read from `Yes`/`No` or `1`/`0`)
    source_text: Option<Vec<Option<String>>>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            data_type,
            values,
            source_text: None,
        }
    }

    /// Remember the raw cells this column was parsed from, one per value.
    pub fn with_source_text(mut self, cells: Vec<Option<String>>) -> Self {
        if cells.len() == self.values.len() {
            self.source_text = Some(cells);
        }
        self
    }

    pub fn source_text(&self) -> Option<&[Option<String>]> {
        self.source_text.as_deref()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn null_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_null()).count()
    }

    /// Coerce every value to `target`. All-or-nothing: the first failing
    /// cell aborts the conversion and the column is left untouched.
    ///
    /// Booleans parsed from text turn back into the tokens they were read
    /// from, so a `Yes`/`No` column stays `Yes`/`No` in a text destination.
    pub fn coerce_to(&self, target: DataType) -> std::result::Result<Column, String> {
        if let (DataType::Text, DataType::Boolean, Some(raw)) =
            (target, self.data_type, &self.source_text)
        {
            let values = self
                .values
                .iter()
                .zip(raw)
                .map(|(value, cell)| match (value, cell) {
                    (Value::Null, _) => Value::Null,
                    (_, Some(token)) => Value::Text(token.clone()),
                    (other, None) => Value::Text(other.to_string()),
                })
                .collect();
            return Ok(Column::new(self.name.clone(), target, values));
        }

        let values = self
            .values
            .iter()
            .enumerate()
            .map(|(row, v)| v.coerce(target).map_err(|e| format!("row {}: {}", row + 1, e)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Column::new(self.name.clone(), target, values))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularBatch {
    columns: Vec<Column>,
}

impl TabularBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from columns, rejecting duplicate names and ragged lengths.
    pub fn from_columns(columns: Vec<Column>) -> Result<Self> {
        let mut batch = Self::new();
        for column in columns {
            batch.push_column(column)?;
        }
        Ok(batch)
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map(Column::len).unwrap_or(0)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Append a new column at the end.
    pub fn push_column(&mut self, column: Column) -> Result<()> {
        if self.has_column(&column.name) {
            return Err(EngineError::Batch(format!(
                "duplicate column '{}'",
                column.name
            )));
        }
        self.check_length(&column)?;
        self.columns.push(column);
        Ok(())
    }

    /// Replace the column with the same name in place, or append it.
    pub fn set_column(&mut self, column: Column) -> Result<()> {
        self.check_length(&column)?;
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
        Ok(())
    }

    pub fn remove_column(&mut self, name: &str) -> Option<Column> {
        let idx = self.columns.iter().position(|c| c.name == name)?;
        Some(self.columns.remove(idx))
    }

    /// Values of one row, in column order
    pub fn row(&self, idx: usize) -> Option<Vec<&Value>> {
        if idx >= self.row_count() {
            return None;
        }
        Some(self.columns.iter().map(|c| &c.values[idx]).collect())
    }

    /// Copy of rows `[start, end)`; `end` is clamped to the row count.
    pub fn slice(&self, start: usize, end: usize) -> TabularBatch {
        let end = end.min(self.row_count());
        let start = start.min(end);
        TabularBatch {
            columns: self
                .columns
                .iter()
                .map(|c| Column::new(c.name.clone(), c.data_type, c.values[start..end].to_vec()))
                .collect(),
        }
    }

    fn check_length(&self, column: &Column) -> Result<()> {
        let others = self.columns.iter().filter(|c| c.name != column.name).count();
        if others > 0 && column.len() != self.row_count_excluding(&column.name) {
            return Err(EngineError::Batch(format!(
                "column '{}' has {} values, batch has {} rows",
                column.name,
                column.len(),
                self.row_count_excluding(&column.name)
            )));
        }
        Ok(())
    }

    fn row_count_excluding(&self, name: &str) -> usize {
        self.columns
            .iter()
            .find(|c| c.name != name)
            .map(Column::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ints(name: &str, values: &[i64]) -> Column {
        Column::new(
            name,
            DataType::Integer,
            values.iter().map(|v| Value::Integer(*v)).collect(),
        )
    }

    #[test]
    fn test_ragged_columns_rejected() {
        let err = TabularBatch::from_columns(vec![ints("a", &[1, 2]), ints("b", &[1])]);
        assert!(matches!(err, Err(EngineError::Batch(_))));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = TabularBatch::from_columns(vec![ints("a", &[1]), ints("a", &[2])]);
        assert!(err.unwrap_err().to_string().contains("duplicate column 'a'"));
    }

    #[test]
    fn test_set_column_replaces_in_place() {
        let mut batch =
            TabularBatch::from_columns(vec![ints("a", &[1, 2]), ints("b", &[3, 4])]).unwrap();
        batch.set_column(ints("a", &[9, 9])).unwrap();
        assert_eq!(batch.column_names(), vec!["a", "b"]);
        assert_eq!(batch.column("a").unwrap().values[0], Value::Integer(9));

        // A single-column batch may be replaced by a column of another length
        let mut single = TabularBatch::from_columns(vec![ints("a", &[1, 2])]).unwrap();
        single.set_column(ints("a", &[1, 2, 3])).unwrap();
        assert_eq!(single.row_count(), 3);
    }

    #[test]
    fn test_remove_and_rows() {
        let mut batch =
            TabularBatch::from_columns(vec![ints("a", &[1, 2]), ints("b", &[3, 4])]).unwrap();
        assert!(batch.remove_column("a").is_some());
        assert!(batch.remove_column("a").is_none());
        assert_eq!(batch.row(1).unwrap(), vec![&Value::Integer(4)]);
        assert!(batch.row(2).is_none());
    }

    #[test]
    fn test_slice_clamps() {
        let batch = TabularBatch::from_columns(vec![ints("a", &[1, 2, 3])]).unwrap();
        assert_eq!(batch.slice(2, 10).row_count(), 1);
        assert_eq!(batch.slice(5, 10).row_count(), 0);
    }

    #[test]
    fn test_coerce_is_all_or_nothing() {
        let col = Column::new(
            "n",
            DataType::Text,
            vec![Value::Text("1".into()), Value::Text("x".into())],
        );
        let err = col.coerce_to(DataType::Integer).unwrap_err();
        assert!(err.starts_with("row 2"));

        let ok = Column::new("n", DataType::Text, vec![Value::Text("1".into()), Value::Null]);
        let coerced = ok.coerce_to(DataType::Integer).unwrap();
        assert_eq!(coerced.data_type, DataType::Integer);
        assert_eq!(coerced.values, vec![Value::Integer(1), Value::Null]);
    }
}

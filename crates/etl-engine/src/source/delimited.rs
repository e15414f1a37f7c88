//! Delimited-file source

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use super::infer::{infer_column, is_null_token};
use super::FileStore;
use crate::batch::TabularBatch;
use crate::error::{EngineError, Result};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Reads uploaded CSV files through a [`FileStore`]
pub struct CsvReader {
    files: Arc<dyn FileStore>,
}

impl CsvReader {
    pub fn new(files: Arc<dyn FileStore>) -> Self {
        Self { files }
    }

    pub async fn read(&self, file_id: &str) -> Result<TabularBatch> {
        let bytes = self.files.fetch(file_id).await?;
        debug!(file_id = %file_id, bytes = bytes.len(), "Fetched source file");

        let batch = parse_csv(&bytes).map_err(|e| match e {
            EngineError::SourceEmpty(msg) => {
                EngineError::SourceEmpty(format!("file {}: {}", file_id, msg))
            },
            EngineError::SourceMalformed(msg) => {
                EngineError::SourceMalformed(format!("file {}: {}", file_id, msg))
            },
            other => other,
        })?;

        info!(
            file_id = %file_id,
            rows = batch.row_count(),
            columns = batch.column_count(),
            "Parsed CSV source"
        );
        Ok(batch)
    }
}

/// Parse CSV bytes (header row required) into a typed batch.
pub fn parse_csv(bytes: &[u8]) -> Result<TabularBatch> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let text = String::from_utf8_lossy(bytes);
    if text.trim().is_empty() {
        return Err(EngineError::SourceEmpty("no header row".to_string()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| EngineError::SourceMalformed(e.to_string()))?
        .clone();
    let names = header_names(headers.iter())?;

    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); names.len()];
    for (idx, record) in reader.records().enumerate() {
        let record = record.map_err(|e| match e.kind() {
            csv::ErrorKind::UnequalLengths { expected_len, len, .. } => {
                EngineError::SourceMalformed(format!(
                    "record {} has {} fields, expected {}",
                    idx + 1,
                    len,
                    expected_len
                ))
            },
            _ => EngineError::SourceMalformed(e.to_string()),
        })?;
        for (col, field) in record.iter().enumerate() {
            let cell = if is_null_token(field) {
                None
            } else {
                Some(field.to_string())
            };
            cells[col].push(cell);
        }
    }

    if cells.first().map(Vec::is_empty).unwrap_or(true) {
        return Err(EngineError::SourceEmpty("no data rows".to_string()));
    }

    TabularBatch::from_columns(
        names
            .iter()
            .zip(cells)
            .map(|(name, values)| infer_column(name, values))
            .collect(),
    )
}

/// Normalize header cells; blanks get positional names, duplicates are
/// rejected.
pub(crate) fn header_names<'a, I>(raw: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for (idx, cell) in raw.into_iter().enumerate() {
        let trimmed = cell.trim();
        let name = if trimmed.is_empty() {
            format!("column_{}", idx + 1)
        } else {
            trimmed.to_string()
        };
        if !seen.insert(name.clone()) {
            return Err(EngineError::SourceMalformed(format!(
                "duplicate column header '{}'",
                name
            )));
        }
        names.push(name);
    }
    if names.is_empty() {
        return Err(EngineError::SourceEmpty("header row has no columns".to_string()));
    }
    Ok(names)
}

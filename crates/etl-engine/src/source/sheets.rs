//! Spreadsheet-range source (Google Sheets values API)

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::delimited::header_names;
use super::infer::{infer_column, is_null_token};
use super::SheetsAccess;
use crate::batch::TabularBatch;
use crate::error::{EngineError, Result};
use crate::models::{SheetRange, SheetSource};

/// Default timeout for Sheets API requests in seconds.
pub const DEFAULT_SHEETS_TIMEOUT_SECS: u64 = 60;

/// Right-most column requested when the range leaves the end column open
const OPEN_END_COLUMN: &str = "ZZZ";

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

pub struct SheetsReader {
    client: Client,
    base_url: String,
    access: Arc<dyn SheetsAccess>,
}

impl SheetsReader {
    pub fn new(base_url: impl Into<String>, access: Arc<dyn SheetsAccess>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_SHEETS_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            access,
        })
    }

    pub async fn read(&self, source: &SheetSource) -> Result<TabularBatch> {
        let a1 = a1_range(&source.sheet_name, &source.range)?;
        let url = self.values_url(&source.spreadsheet_id, &a1)?;
        let token = self.access.access_token(source.credential_id).await?;

        debug!(spreadsheet_id = %source.spreadsheet_id, range = %a1, "Fetching sheet values");

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(&[("majorDimension", "ROWS")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            warn!(
                spreadsheet_id = %source.spreadsheet_id,
                status = status.as_u16(),
                error = %message,
                "Sheets API request failed"
            );
            return Err(map_status(status, source, &message));
        }

        let payload: ValueRange = response.json().await?;
        let batch = rows_to_batch(payload.values, &source.range)?;

        info!(
            spreadsheet_id = %source.spreadsheet_id,
            sheet = %source.sheet_name,
            rows = batch.row_count(),
            columns = batch.column_count(),
            "Fetched sheet data"
        );
        Ok(batch)
    }

    fn values_url(&self, spreadsheet_id: &str, a1: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            etl_common::CommonError::Config(format!(
                "invalid Sheets API base URL '{}': {}",
                self.base_url, e
            ))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                etl_common::CommonError::Config(format!(
                    "Sheets API base URL '{}' cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", spreadsheet_id, "values", a1]);
        Ok(url)
    }
}

fn map_status(status: StatusCode, source: &SheetSource, message: &str) -> EngineError {
    let target = format!(
        "sheet '{}' of spreadsheet {}",
        source.sheet_name, source.spreadsheet_id
    );
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            EngineError::SourcePermissionDenied(format!("{}: {}", target, message))
        },
        StatusCode::NOT_FOUND => EngineError::SourceNotFound(format!("{}: {}", target, message)),
        // The API answers an unknown sheet name with "Unable to parse range"
        StatusCode::BAD_REQUEST if message.contains("Unable to parse range") => {
            EngineError::SourceNotFound(format!("{}: {}", target, message))
        },
        _ => EngineError::SourceMalformed(format!(
            "{}: unexpected response {}: {}",
            target, status, message
        )),
    }
}

/// 1-based column index of an A1 column label ("A" = 1, "AA" = 27)
fn column_index(label: &str) -> Option<u32> {
    if label.is_empty() || label.len() > 3 {
        return None;
    }
    label.chars().try_fold(0u32, |acc, c| {
        c.is_ascii_alphabetic()
            .then(|| acc * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1))
    })
}

/// Build the A1 range string for a sheet window, validating its bounds.
pub fn a1_range(sheet_name: &str, range: &SheetRange) -> Result<String> {
    if sheet_name.trim().is_empty() {
        return Err(EngineError::SourceRangeInvalid("sheet name is empty".to_string()));
    }
    if range.start_row == 0 {
        return Err(EngineError::SourceRangeInvalid(
            "rows are 1-based; start row 0 is invalid".to_string(),
        ));
    }
    if let Some(end) = range.end_row {
        if range.start_row > end {
            return Err(EngineError::SourceRangeInvalid(format!(
                "start row {} is after end row {}",
                range.start_row, end
            )));
        }
    }
    let header = range.header_row();
    if header < range.start_row || range.end_row.is_some_and(|end| header > end) {
        return Err(EngineError::SourceRangeInvalid(format!(
            "header row {} is outside rows {}..{}",
            header,
            range.start_row,
            range
                .end_row
                .map(|e| e.to_string())
                .unwrap_or_else(|| "end".to_string())
        )));
    }

    let start_col = range.start_column.as_deref().unwrap_or("A").trim().to_uppercase();
    let end_col = range
        .end_column
        .as_deref()
        .unwrap_or(OPEN_END_COLUMN)
        .trim()
        .to_uppercase();
    let (start_idx, end_idx) = match (column_index(&start_col), column_index(&end_col)) {
        (Some(s), Some(e)) => (s, e),
        _ => {
            return Err(EngineError::SourceRangeInvalid(format!(
                "invalid column bounds {}:{}",
                start_col, end_col
            )))
        },
    };
    if start_idx > end_idx {
        return Err(EngineError::SourceRangeInvalid(format!(
            "start column {} is after end column {}",
            start_col, end_col
        )));
    }

    let quoted = sheet_name.replace('\'', "''");
    let end_row = range.end_row.map(|r| r.to_string()).unwrap_or_default();
    Ok(format!(
        "'{}'!{}{}:{}{}",
        quoted, start_col, range.start_row, end_col, end_row
    ))
}

fn cell_text(cell: &serde_json::Value) -> Option<String> {
    let text = match cell {
        serde_json::Value::Null => return None,
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if is_null_token(&text) {
        None
    } else {
        Some(text)
    }
}

/// Turn the fetched rows (starting at `range.start_row`) into a batch. Rows
/// shorter than the header are padded with empty cells.
///
/// A range without values gives a batch without columns, and a header
/// without data rows gives zero-row text columns; neither is an error.
pub fn rows_to_batch(rows: Vec<Vec<serde_json::Value>>, range: &SheetRange) -> Result<TabularBatch> {
    if rows.is_empty() {
        return Ok(TabularBatch::new());
    }

    let header_offset = (range.header_row() - range.start_row) as usize;
    let header = rows.get(header_offset).ok_or_else(|| {
        EngineError::SourceRangeInvalid(format!(
            "header row {} is outside the {} fetched rows",
            range.header_row(),
            rows.len()
        ))
    })?;

    let header_cells: Vec<String> = header
        .iter()
        .map(|c| cell_text(c).unwrap_or_default())
        .collect();
    let names = header_names(header_cells.iter().map(String::as_str))?;

    let data = &rows[header_offset + 1..];

    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::with_capacity(data.len()); names.len()];
    for row in data {
        for (col, column_cells) in cells.iter_mut().enumerate() {
            column_cells.push(row.get(col).and_then(cell_text));
        }
    }

    TabularBatch::from_columns(
        names
            .iter()
            .zip(cells)
            .map(|(name, values)| infer_column(name, values))
            .collect(),
    )
}

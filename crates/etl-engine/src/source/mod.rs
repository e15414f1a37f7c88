//! Source readers
//!
//! A source is fully materialized into a [`TabularBatch`] before the
//! pipeline moves on. Two kinds are supported:
//!
//! - **Delimited files** previously uploaded and addressed by an opaque file id
//! - **Spreadsheet ranges** read through the Google Sheets values API
//!
//! The bytes behind a file id and the bearer token behind a sheet credential
//! come from external services, reached through [`FileStore`] and
//! [`SheetsAccess`].

pub mod delimited;
pub mod infer;
pub mod sheets;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::batch::TabularBatch;
use crate::error::{EngineError, Result};
use crate::models::SourceConfig;

pub use delimited::{parse_csv, CsvReader};
pub use sheets::SheetsReader;

/// Resolves an uploaded file id to its bytes
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn fetch(&self, file_id: &str) -> Result<Vec<u8>>;
}

/// Uploaded files stored as `{root}/{file_id}.csv`
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, file_id: &str) -> Result<PathBuf> {
        // File ids are opaque tokens, never paths
        let valid = !file_id.is_empty()
            && file_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(EngineError::SourceNotFound(format!(
                "invalid file id '{}'",
                file_id
            )));
        }
        Ok(self.root.join(format!("{}.csv", file_id)))
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn fetch(&self, file_id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(file_id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                EngineError::SourceNotFound(format!("file {} ({})", file_id, path.display())),
            ),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Err(
                EngineError::SourcePermissionDenied(format!("file {}: {}", file_id, e)),
            ),
            Err(e) => Err(e.into()),
        }
    }
}

/// Resolves an opaque sheet credential to a bearer access token
#[async_trait]
pub trait SheetsAccess: Send + Sync {
    async fn access_token(&self, credential_id: i64) -> Result<String>;
}

/// Same token for every credential; used by tests and local runs
#[derive(Debug, Clone)]
pub struct StaticTokenAccess(pub String);

#[async_trait]
impl SheetsAccess for StaticTokenAccess {
    async fn access_token(&self, _credential_id: i64) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Dispatches a [`SourceConfig`] to the reader for its kind
pub struct SourceReader {
    csv: CsvReader,
    sheets: SheetsReader,
}

impl SourceReader {
    pub fn new(files: Arc<dyn FileStore>, sheets: SheetsReader) -> Self {
        Self {
            csv: CsvReader::new(files),
            sheets,
        }
    }

    pub async fn read(&self, config: &SourceConfig) -> Result<TabularBatch> {
        info!(source = %config.describe(), "Reading source");
        // Only file sources treat a missing header or missing rows as an
        // error; a sheet without data rows loads nothing.
        match config {
            SourceConfig::Csv { file_id } => self.csv.read(file_id).await,
            SourceConfig::GoogleSheets(sheet) => self.sheets.read(sheet).await,
        }
    }
}

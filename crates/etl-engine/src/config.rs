//! Configuration management

use serde::{Deserialize, Serialize};

use crate::models::DEFAULT_BATCH_SIZE;

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/etl";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default directory holding uploaded source files.
pub const DEFAULT_UPLOAD_DIR: &str = "./uploads";

/// Default Google Sheets API endpoint.
pub const DEFAULT_SHEETS_API_BASE_URL: &str = "https://sheets.googleapis.com";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub sources: SourceSettings,
    pub load: LoadSettings,
}

/// Job/run persistence database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    pub upload_dir: String,
    pub sheets_api_base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSettings {
    /// Used when a job definition carries no batch size of its own
    pub default_batch_size: usize,
    /// Serialize runs per destination table with an advisory lock
    pub lock_destination: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = EngineConfig {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_parse(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_parse(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_parse(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_parse(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
            },
            sources: SourceSettings {
                upload_dir: std::env::var("UPLOAD_DIR")
                    .unwrap_or_else(|_| DEFAULT_UPLOAD_DIR.to_string()),
                sheets_api_base_url: std::env::var("SHEETS_API_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_SHEETS_API_BASE_URL.to_string()),
            },
            load: LoadSettings {
                default_batch_size: env_parse("DEFAULT_BATCH_SIZE", DEFAULT_BATCH_SIZE),
                lock_destination: env_parse("ETL_LOCK_DESTINATION", false),
            },
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.load.default_batch_size == 0 {
            anyhow::bail!("DEFAULT_BATCH_SIZE must be greater than 0");
        }

        if self.sources.sheets_api_base_url.is_empty() {
            anyhow::bail!("Sheets API base URL cannot be empty");
        }

        if self.sources.upload_dir.is_empty() {
            tracing::warn!("UPLOAD_DIR is empty - file sources resolve against the working directory");
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            sources: SourceSettings {
                upload_dir: DEFAULT_UPLOAD_DIR.to_string(),
                sheets_api_base_url: DEFAULT_SHEETS_API_BASE_URL.to_string(),
            },
            load: LoadSettings {
                default_batch_size: DEFAULT_BATCH_SIZE,
                lock_destination: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_pool_bounds() {
        let mut config = EngineConfig::default();
        config.database.min_connections = 10;
        config.database.max_connections = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let mut config = EngineConfig::default();
        config.load.default_batch_size = 0;
        assert!(config.validate().is_err());
    }
}

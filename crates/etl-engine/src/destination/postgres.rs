//! PostgreSQL (and Redshift) destination over a single `PgConnection`

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use tracing::{debug, info};

use etl_common::identifier::{quote_ident, quoted_list, validate_identifier};

use super::{
    ColumnInfo, Destination, DestinationConnector, SchemaSnapshot, TableRef, UniqueConstraint,
};
use crate::batch::TabularBatch;
use crate::error::Result;
use crate::loader::dml::{build_write, statement_ranges};
use crate::loader::WritePlan;
use crate::models::DestinationConfig;
use crate::store::CredentialStore;

const TABLE_EXISTS_SQL: &str = r#"
    SELECT EXISTS (
        SELECT 1
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind IN ('r', 'p')
    )
"#;

const DESCRIBE_SQL: &str = r#"
    SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), NOT a.attnotnull
    FROM pg_attribute a
    JOIN pg_class c ON c.oid = a.attrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relname = $2
      AND a.attnum > 0 AND NOT a.attisdropped
    ORDER BY a.attnum
"#;

/// Unique indexes usable as ON CONFLICT arbiters (no predicate, no
/// expressions); primary keys and UNIQUE constraints are backed by these.
const UNIQUE_INDEXES_SQL: &str = r#"
    SELECT i.relname::text,
           ix.indisprimary,
           ARRAY(
               SELECT a.attname::text
               FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
               JOIN pg_attribute a ON a.attrelid = ix.indrelid AND a.attnum = k.attnum
               ORDER BY k.ord
           )
    FROM pg_index ix
    JOIN pg_class i ON i.oid = ix.indexrelid
    JOIN pg_class c ON c.oid = ix.indrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relname = $2
      AND ix.indisunique AND ix.indpred IS NULL AND ix.indexprs IS NULL
    ORDER BY ix.indisprimary DESC, i.relname
"#;

const PRIMARY_KEY_NAME_SQL: &str = r#"
    SELECT con.conname::text
    FROM pg_constraint con
    JOIN pg_class c ON c.oid = con.conrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1 AND c.relname = $2 AND con.contype = 'p'
"#;

/// Opens destination connections from credentials in the credential store
pub struct PgConnector {
    credentials: Arc<dyn CredentialStore>,
}

impl PgConnector {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl DestinationConnector for PgConnector {
    async fn connect(&self, config: &DestinationConfig) -> Result<Box<dyn Destination>> {
        let url = self.credentials.resolve_connection(config.credential_id).await?;
        let conn = PgConnection::connect(url.expose()).await?;
        debug!(
            kind = ?config.kind,
            table = %config.qualified_table(),
            "Connected to destination; concurrent runs on this table are not coordinated unless \
             destination locking is enabled"
        );
        Ok(Box::new(PgDestination::new(conn, TableRef::from(config))))
    }
}

pub struct PgDestination {
    conn: PgConnection,
    table: TableRef,
    holds_lock: bool,
}

impl PgDestination {
    pub fn new(conn: PgConnection, table: TableRef) -> Self {
        Self {
            conn,
            table,
            holds_lock: false,
        }
    }

    async fn exists(&mut self) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(TABLE_EXISTS_SQL)
            .bind(&self.table.schema)
            .bind(&self.table.table)
            .fetch_one(&mut self.conn)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl Destination for PgDestination {
    fn table(&self) -> &TableRef {
        &self.table
    }

    async fn describe(&mut self) -> Result<Option<SchemaSnapshot>> {
        if !self.exists().await? {
            return Ok(None);
        }
        let rows: Vec<(String, String, bool)> = sqlx::query_as(DESCRIBE_SQL)
            .bind(&self.table.schema)
            .bind(&self.table.table)
            .fetch_all(&mut self.conn)
            .await?;
        Ok(Some(SchemaSnapshot::new(
            rows.into_iter()
                .map(|(name, native_type, nullable)| ColumnInfo {
                    name,
                    native_type,
                    nullable,
                })
                .collect(),
        )))
    }

    async fn execute_ddl(&mut self, ddl: &str) -> Result<()> {
        info!(table = %self.table, "Executing table DDL");
        sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(ddl)).await?;
        Ok(())
    }

    async fn add_column(&mut self, name: &str, native_type: &str) -> Result<()> {
        validate_identifier(name, "column")?;
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.table.qualified(),
            quote_ident(name),
            native_type
        );
        sqlx::query(&sql).execute(&mut self.conn).await?;
        Ok(())
    }

    async fn truncate(&mut self) -> Result<()> {
        let sql = format!("TRUNCATE TABLE {}", self.table.qualified());
        sqlx::query(&sql).execute(&mut self.conn).await?;
        Ok(())
    }

    async fn drop_table(&mut self) -> Result<()> {
        let sql = format!("DROP TABLE {}", self.table.qualified());
        sqlx::query(&sql).execute(&mut self.conn).await?;
        Ok(())
    }

    async fn unique_constraints(&mut self) -> Result<Vec<UniqueConstraint>> {
        let rows: Vec<(String, bool, Vec<String>)> = sqlx::query_as(UNIQUE_INDEXES_SQL)
            .bind(&self.table.schema)
            .bind(&self.table.table)
            .fetch_all(&mut self.conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name, is_primary, columns)| UniqueConstraint {
                name,
                columns,
                is_primary,
            })
            .collect())
    }

    async fn replace_primary_key(&mut self, columns: &[String]) -> Result<()> {
        for column in columns {
            validate_identifier(column, "column")?;
        }
        let qualified = self.table.qualified();
        let mut tx = self.conn.begin().await?;

        let existing: Option<(String,)> = sqlx::query_as(PRIMARY_KEY_NAME_SQL)
            .bind(&self.table.schema)
            .bind(&self.table.table)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some((name,)) = existing {
            let sql = format!("ALTER TABLE {} DROP CONSTRAINT {}", qualified, quote_ident(&name));
            sqlx::query(&sql).execute(&mut *tx).await?;
        }

        let sql = format!("ALTER TABLE {} ADD PRIMARY KEY ({})", qualified, quoted_list(columns));
        sqlx::query(&sql).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn lock_table(&mut self) -> Result<()> {
        debug!(table = %self.table, "Waiting for destination lock");
        sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
            .bind(self.table.key())
            .execute(&mut self.conn)
            .await?;
        self.holds_lock = true;
        info!(table = %self.table, "Acquired destination lock");
        Ok(())
    }

    async fn write_slice(&mut self, plan: &WritePlan, slice: &TabularBatch) -> Result<u64> {
        let rows = slice.row_count();
        let mut tx = self.conn.begin().await?;
        for (start, end) in statement_ranges(rows, plan.columns.len()) {
            let mut query = build_write(plan, slice, start, end);
            query.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(rows as u64)
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        if self.holds_lock {
            let key = self.table.key();
            sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
                .bind(key)
                .execute(&mut self.conn)
                .await?;
        }
        let this = *self;
        this.conn.close().await?;
        Ok(())
    }
}

//! Connection pools for the target store
//!
//! The backend is picked once from configuration. Both the SQL ledger and the
//! load adapter share the same pool.

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Closed set of supported stores
#[derive(Debug, Clone)]
pub enum Store {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl Store {
    /// Open a pool with at least `min_connections` connections available.
    ///
    /// The pool must cover every concurrent loader plus the ledger, otherwise
    /// workers starve waiting on each other.
    pub async fn connect(config: &DatabaseConfig, min_connections: u32) -> Result<Self> {
        let max_connections = min_connections.max(1) + 1;
        let url = config.connection_url();

        let store = match config.backend {
            DatabaseBackend::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
                    .connect(&url)
                    .await?;
                Store::Postgres(pool)
            },
            DatabaseBackend::Sqlite => {
                let options = SqliteConnectOptions::from_str(&url)?
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS));
                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
                    .connect_with(options)
                    .await?;
                Store::Sqlite(pool)
            },
        };

        info!(
            backend = store.backend().as_str(),
            url = %config.redacted_url(),
            max_connections,
            "Database connection pool created"
        );
        Ok(store)
    }

    /// Open (creating if needed) a SQLite file directly
    pub async fn sqlite_file(path: &std::path::Path, max_connections: u32) -> Result<Self> {
        let config = DatabaseConfig {
            backend: DatabaseBackend::Sqlite,
            sqlite_file: path.to_path_buf(),
            ..DatabaseConfig::default()
        };
        Self::connect(&config, max_connections).await
    }

    pub fn backend(&self) -> DatabaseBackend {
        match self {
            Store::Postgres(_) => DatabaseBackend::Postgres,
            Store::Sqlite(_) => DatabaseBackend::Sqlite,
        }
    }

    /// Run a statement without arguments (DDL, maintenance)
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let affected = match self {
            Store::Postgres(pool) => sqlx::query(sql).execute(pool).await?.rows_affected(),
            Store::Sqlite(pool) => sqlx::query(sql).execute(pool).await?.rows_affected(),
        };
        Ok(affected)
    }

    pub async fn health_check(&self) -> Result<()> {
        self.execute("SELECT 1").await.map(|_| ())
    }

    pub async fn close(&self) {
        match self {
            Store::Postgres(pool) => pool.close().await,
            Store::Sqlite(pool) => pool.close().await,
        }
    }
}

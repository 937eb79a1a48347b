//! Database access for the relational store backing repositories, builds,
//! results, and releases.

pub mod build;
pub mod repository;
pub mod result;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::{DingError, Result};

/// Database connection pool.
pub type DbPool = SqlitePool;

const DEFAULT_MAX_CONNECTIONS: u32 = 20;

/// Creates and initializes the database connection pool.
///
/// The pool size can be configured via `DATABASE_MAX_CONNECTIONS`.
pub async fn create_pool(database_url: &str) -> Result<DbPool> {
    let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONNECTIONS);

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| DingError::Configuration(format!("invalid database url: {e}")))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    tracing::debug!(max_connections, "database pool created");

    Ok(pool)
}

/// Runs pending schema migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("database migrations completed");
    Ok(())
}

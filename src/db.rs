//! SQLite connection pool shared by the sink and the counter store
//!
//! - WAL mode for concurrent reads/writes
//! - Busy timeout so concurrent writers queue instead of failing
//! - Embedded migrations run on connect

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Open a pool for `database_url` and bring the schema up to date
///
/// # Example
///
/// ```ignore
/// let pool = db::connect("sqlite:./data/telemetry.db").await?;
/// ```
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("Invalid database url: {}", database_url))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30))
        .pragma("cache_size", "-64000")
        .pragma("temp_store", "memory")
        .pragma("synchronous", "NORMAL");

    // create_if_missing makes the file, not its directory
    if !is_in_memory(database_url) {
        if let Some(parent) = options.get_filename().parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5) // single writer anyway
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await
        .context("Failed to connect to telemetry database")?;

    run_migrations(&pool).await?;

    Ok(pool)
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run telemetry database migrations")?;

    tracing::info!("Telemetry database migrations completed");
    Ok(())
}

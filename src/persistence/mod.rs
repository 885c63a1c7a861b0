//! Persistence Layer
//!
//! Durable storage for trades and their append-only audit trail, on SQLite
//! via sqlx. Schema is migrated in-code at startup.
//!
//! Transient connectivity failures are retried with increasing backoff up to
//! a bounded attempt count by [`with_retry`], then escalated as a hard
//! failure. Query-shaped errors (constraint violations, bad SQL) are never
//! retried.

pub mod models;
pub mod repository;

use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{info, warn};

/// Database connection pool
pub type DbPool = SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    MigrationError(String),

    #[error("query error: {0}")]
    QueryError(String),
}

/// Bounded-retry policy for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

fn is_transient(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}

/// Run a store operation, retrying transient failures with growing delay.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &str,
    mut f: F,
) -> Result<T, DatabaseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt + 1 < policy.attempts => {
                attempt += 1;
                warn!(
                    "Transient store failure in {} (attempt {}/{}): {}",
                    op, attempt, policy.attempts, e
                );
                tokio::time::sleep(policy.base_delay * attempt).await;
            }
            Err(e) => {
                return Err(DatabaseError::QueryError(format!("{op}: {e}")));
            }
        }
    }
}

/// Initialize the database connection pool and run migrations.
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    // Ensure the data directory exists for file-backed databases
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized");

    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('Buy', 'Sell')),
            entry_price REAL NOT NULL,
            quantity REAL NOT NULL,
            position_size REAL NOT NULL,
            leverage INTEGER NOT NULL,
            tp1_price REAL,
            tp2_price REAL,
            tp3_price REAL,
            sl_price REAL NOT NULL,
            current_sl REAL NOT NULL,
            current_tp REAL,
            tp1_order_id TEXT,
            tp2_order_id TEXT,
            tp3_order_id TEXT,
            strategy_type TEXT NOT NULL,
            status TEXT NOT NULL,
            bot_name TEXT NOT NULL,
            pnl REAL NOT NULL DEFAULT 0.0,
            pnl_percent REAL NOT NULL DEFAULT 0.0,
            filled_at DATETIME,
            closed_at DATETIME,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create trades table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trade_updates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            trade_id INTEGER NOT NULL,
            status TEXT NOT NULL,
            price REAL,
            sl_price REAL,
            tp_price REAL,
            pnl REAL,
            notes TEXT,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (trade_id) REFERENCES trades(id)
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create trade_updates table: {}", e))
    })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_order_id ON trades(order_id)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_trade_updates_trade_id ON trade_updates(trade_id)",
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    info!("Database migrations completed");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_init() {
        let pool = init_database("sqlite::memory:").await;
        assert!(pool.is_ok());
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let pool = init_database("sqlite::memory:").await.unwrap();

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('trades', 'trade_updates')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 2);
    }

    #[tokio::test]
    async fn test_with_retry_passes_through_non_transient() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        };
        let mut calls = 0;
        let result: Result<(), DatabaseError> = with_retry(&policy, "test op", || {
            calls += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}

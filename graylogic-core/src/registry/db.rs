//! SQLite pool construction and migrations
//!
//! WAL journal with `synchronous=NORMAL`; a single writer serializes on the
//! SQLite side while readers proceed concurrently.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// Open (creating if missing) the database and run embedded migrations
pub async fn connect(config: &DatabaseConfig) -> Result<SqlitePool> {
    connect_path(&config.path, config.max_connections).await
}

/// Open a pool against an explicit path; used directly by tests
pub async fn connect_path(path: &Path, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("sqlite open {}: {e}", path.display())))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| Error::ConfigInvalid(format!("migrations: {e}")))?;

    Ok(pool)
}

#[cfg(test)]
pub async fn connect_memory() -> SqlitePool {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_cleanly() {
        let pool = connect_memory().await;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn file_database_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect_path(&dir.path().join("test.db"), 2).await.unwrap();
        sqlx::query("INSERT INTO sites (id, name, slug, created_at, updated_at) VALUES ('s1', 'Home', 'home', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')")
            .execute(&pool)
            .await
            .unwrap();
        let slug: String = sqlx::query_scalar("SELECT slug FROM sites WHERE id = 's1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(slug, "home");
    }
}

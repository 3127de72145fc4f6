//! Pool construction for the conversation store.
//!
//! File databases are created on first use and run in WAL mode. In-memory URLs
//! get one shared-cache database per pool, visible to every pooled connection.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use syncso_core::config::DatabaseConfig;
use tracing::info;

pub type DbPool = sqlx::SqlitePool;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a pool from the `[database]` section.
pub async fn connect(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    let url = config.url.trim();
    let in_memory = is_in_memory(url);

    let mut options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(Duration::from_secs(config.timeout_secs.max(1)))
        .connect_with(options)
        .await?;

    info!(
        event_name = "db.pool.connected",
        in_memory,
        max_connections = config.max_connections,
        "database pool ready"
    );
    Ok(pool)
}

fn is_in_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

#[cfg(test)]
mod tests {
    use syncso_core::config::DatabaseConfig;
    use tempfile::TempDir;

    use super::{connect, is_in_memory};

    fn database(url: impl Into<String>, max_connections: u32) -> DatabaseConfig {
        DatabaseConfig { url: url.into(), max_connections, timeout_secs: 5 }
    }

    #[test]
    fn memory_urls_are_recognized() {
        assert!(is_in_memory("sqlite::memory:"));
        assert!(is_in_memory(":memory:"));
        assert!(is_in_memory("sqlite://file:syncso?mode=memory&cache=shared"));
        assert!(!is_in_memory("sqlite://syncso.db"));
    }

    #[tokio::test]
    async fn file_database_is_created_with_wal_and_foreign_keys() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("syncso.db");
        assert!(!path.exists());

        let pool = connect(&database(format!("sqlite://{}", path.display()), 2))
            .await
            .expect("connect should create the file");

        let (journal_mode,): (String,) =
            sqlx::query_as("PRAGMA journal_mode").fetch_one(&pool).await.expect("journal mode");
        let (foreign_keys,): (i64,) =
            sqlx::query_as("PRAGMA foreign_keys").fetch_one(&pool).await.expect("foreign keys");
        assert_eq!(journal_mode.to_lowercase(), "wal");
        assert_eq!(foreign_keys, 1);
        assert!(path.exists());

        pool.close().await;
    }

    #[tokio::test]
    async fn memory_pool_connections_share_one_database() {
        let pool = connect(&database("sqlite::memory:", 2)).await.expect("connect");

        let mut writer = pool.acquire().await.expect("first connection");
        sqlx::query("CREATE TABLE notes (body TEXT NOT NULL)")
            .execute(&mut *writer)
            .await
            .expect("create");
        sqlx::query("INSERT INTO notes (body) VALUES ('hello')")
            .execute(&mut *writer)
            .await
            .expect("insert");

        let mut reader = pool.acquire().await.expect("second connection");
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notes")
            .fetch_one(&mut *reader)
            .await
            .expect("count");
        assert_eq!(count, 1);

        drop(writer);
        drop(reader);
        pool.close().await;
    }

    #[tokio::test]
    async fn separate_memory_pools_are_isolated() {
        let first = connect(&database("sqlite::memory:", 1)).await.expect("first pool");
        let second = connect(&database("sqlite::memory:", 1)).await.expect("second pool");

        sqlx::query("CREATE TABLE notes (body TEXT)").execute(&first).await.expect("create");
        let (tables,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'notes'",
        )
        .fetch_one(&second)
        .await
        .expect("schema query");
        assert_eq!(tables, 0);

        first.close().await;
        second.close().await;
    }
}

use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Number of embedded migrations not yet applied to `pool`.
pub async fn pending_count(pool: &DbPool) -> Result<usize, sqlx::Error> {
    let applied: Vec<i64> = sqlx::query_scalar("SELECT version FROM _sqlx_migrations")
        .fetch_all(pool)
        .await
        .unwrap_or_default();
    Ok(MIGRATOR.iter().filter(|migration| !applied.contains(&migration.version)).count())
}

#[cfg(test)]
mod tests {
    use sqlx::Row;
    use syncso_core::config::DatabaseConfig;

    use super::{pending_count, run_pending};
    use crate::{connect, DbPool};

    const MANAGED_SCHEMA_OBJECTS: &[&str] =
        &["conversation_memory", "idx_conversation_memory_updated_at"];

    async fn memory_pool() -> DbPool {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            timeout_secs: 30,
        };
        connect(&config).await.expect("connect")
    }

    #[tokio::test]
    async fn migrations_create_memory_table() {
        let pool = memory_pool().await;
        assert_eq!(pending_count(&pool).await.expect("pending"), 1);

        run_pending(&pool).await.expect("run migrations");

        for object in MANAGED_SCHEMA_OBJECTS {
            let count = sqlx::query(
                "SELECT COUNT(*) AS count FROM sqlite_master WHERE name = ?",
            )
            .bind(object)
            .fetch_one(&pool)
            .await
            .expect("query schema")
            .get::<i64, _>("count");
            assert_eq!(count, 1, "missing schema object {object}");
        }
        assert_eq!(pending_count(&pool).await.expect("pending"), 0);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = memory_pool().await;
        run_pending(&pool).await.expect("first run");
        run_pending(&pool).await.expect("second run");
    }
}

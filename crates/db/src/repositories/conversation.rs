//! SQLite-backed conversation memory: one JSON document per session.

use async_trait::async_trait;
use sqlx::Row;
use syncso_core::domain::memory::ConversationMemory;
use syncso_core::memory_store::{ConversationMemoryStore, MemoryStoreError};
use tracing::debug;

use super::RepositoryError;
use crate::DbPool;

pub struct SqlConversationMemoryStore {
    pool: DbPool,
}

impl SqlConversationMemoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, session_id: &str) -> Result<Option<ConversationMemory>, RepositoryError> {
        let row = sqlx::query("SELECT document FROM conversation_memory WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let document: String = row.try_get("document")?;
            serde_json::from_str(&document).map_err(|error| {
                RepositoryError::Decode(format!("session `{session_id}`: {error}"))
            })
        })
        .transpose()
    }

    async fn upsert(&self, memory: &ConversationMemory) -> Result<(), RepositoryError> {
        let document = serde_json::to_string(memory)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO conversation_memory \
                (session_id, document, turn_count, delegation_count, started_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(session_id) DO UPDATE SET \
                document = excluded.document, \
                turn_count = excluded.turn_count, \
                delegation_count = excluded.delegation_count, \
                updated_at = excluded.updated_at",
        )
        .bind(&memory.session_id)
        .bind(document)
        .bind(i64::try_from(memory.turns.len()).unwrap_or(i64::MAX))
        .bind(i64::try_from(memory.delegations.len()).unwrap_or(i64::MAX))
        .bind(memory.started_at.to_rfc3339())
        .bind(memory.last_activity_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(
            event_name = "db.memory.saved",
            session_id = %memory.session_id,
            turns = memory.turns.len(),
            delegations = memory.delegations.len(),
            "conversation memory saved"
        );
        Ok(())
    }

    async fn remove(&self, session_id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM conversation_memory WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn session_count(&self) -> Result<i64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM conversation_memory")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }
}

#[async_trait]
impl ConversationMemoryStore for SqlConversationMemoryStore {
    async fn load(&self, session_id: &str) -> Result<Option<ConversationMemory>, MemoryStoreError> {
        Ok(self.fetch(session_id).await?)
    }

    async fn save(&self, memory: &ConversationMemory) -> Result<(), MemoryStoreError> {
        Ok(self.upsert(memory).await?)
    }

    async fn delete(&self, session_id: &str) -> Result<bool, MemoryStoreError> {
        Ok(self.remove(session_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use syncso_core::config::DatabaseConfig;
    use syncso_core::domain::memory::{ConversationMemory, DelegationRecord};
    use syncso_core::domain::message::Role;
    use syncso_core::memory_store::{ConversationMemoryStore, MemoryStoreError};

    use super::SqlConversationMemoryStore;
    use crate::{connect, migrations};

    async fn store() -> SqlConversationMemoryStore {
        let pool = connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            timeout_secs: 30,
        })
        .await
        .expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        SqlConversationMemoryStore::new(pool)
    }

    fn memory(session_id: &str) -> ConversationMemory {
        let mut memory = ConversationMemory::new(session_id);
        memory.push_turn(Role::User, "research Acme");
        memory.record_delegation(DelegationRecord {
            run_id: "run-1".to_string(),
            step_id: "single".to_string(),
            step_index: 0,
            agent_id: "growth".into(),
            input: "research Acme".to_string(),
            output: "Acme builds robots.".to_string(),
            success: true,
            completed_at: Utc::now(),
        });
        memory.facts.insert("last_agent".to_string(), "growth".to_string());
        memory
    }

    #[tokio::test]
    async fn missing_session_loads_as_none() {
        let store = store().await;
        assert_eq!(store.load("nobody").await.expect("load"), None);
    }

    #[tokio::test]
    async fn save_upserts_the_session_document() {
        let store = store().await;
        let mut saved = memory("s-1");
        store.save(&saved).await.expect("first save");

        saved.push_turn(Role::Assistant, "Acme builds robots.");
        store.save(&saved).await.expect("second save");

        let loaded = store.load("s-1").await.expect("load").expect("memory");
        assert_eq!(loaded.turns.len(), 2);
        assert_eq!(loaded.delegations, saved.delegations);
        assert_eq!(loaded.facts.get("last_agent").map(String::as_str), Some("growth"));
        assert_eq!(store.session_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn delete_reports_whether_a_session_existed() {
        let store = store().await;
        store.save(&memory("s-2")).await.expect("save");

        assert!(store.delete("s-2").await.expect("delete"));
        assert!(!store.delete("s-2").await.expect("second delete"));
        assert_eq!(store.load("s-2").await.expect("load"), None);
    }

    #[tokio::test]
    async fn corrupt_documents_surface_as_decode_errors() {
        let store = store().await;
        sqlx::query(
            "INSERT INTO conversation_memory \
                (session_id, document, started_at, updated_at) VALUES ('bad', '{', 'x', 'x')",
        )
        .execute(&store.pool)
        .await
        .expect("insert corrupt row");

        let result = store.load("bad").await;
        assert!(matches!(result, Err(MemoryStoreError::Decode(_))));
    }
}

//! Persistence contract for cross-turn conversation memory.
//!
//! The orchestrator only ever loads at the start of a run and saves whole
//! documents; backends decide how to store them.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::memory::ConversationMemory;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MemoryStoreError {
    #[error("memory backend failure: {0}")]
    Backend(String),
    #[error("memory decode failure: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ConversationMemoryStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<ConversationMemory>, MemoryStoreError>;
    async fn save(&self, memory: &ConversationMemory) -> Result<(), MemoryStoreError>;
    async fn delete(&self, session_id: &str) -> Result<bool, MemoryStoreError>;
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    sessions: RwLock<HashMap<String, ConversationMemory>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConversationMemoryStore for InMemoryConversationStore {
    async fn load(&self, session_id: &str) -> Result<Option<ConversationMemory>, MemoryStoreError> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        Ok(sessions.get(session_id).cloned())
    }

    async fn save(&self, memory: &ConversationMemory) -> Result<(), MemoryStoreError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(memory.session_id.clone(), memory.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, MemoryStoreError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        Ok(sessions.remove(session_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::{ConversationMemoryStore, InMemoryConversationStore};
    use crate::domain::memory::ConversationMemory;
    use crate::domain::message::Role;

    #[tokio::test]
    async fn save_then_load_returns_latest_document() {
        let store = InMemoryConversationStore::new();
        let mut memory = ConversationMemory::new("session-1");
        memory.push_turn(Role::User, "first");
        store.save(&memory).await.expect("save");

        memory.push_turn(Role::Assistant, "second");
        store.save(&memory).await.expect("save again");

        let loaded = store.load("session-1").await.expect("load").expect("memory present");
        assert_eq!(loaded.turns.len(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn delete_reports_whether_session_existed() {
        let store = InMemoryConversationStore::new();
        store.save(&ConversationMemory::new("session-2")).await.expect("save");

        assert!(store.delete("session-2").await.expect("delete"));
        assert!(!store.delete("session-2").await.expect("delete twice"));
        assert!(store.load("session-2").await.expect("load").is_none());
    }
}

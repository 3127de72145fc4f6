use syncso_core::memory_store::MemoryStoreError;
use thiserror::Error;

pub mod conversation;

pub use conversation::SqlConversationMemoryStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for MemoryStoreError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Database(error) => MemoryStoreError::Backend(error.to_string()),
            RepositoryError::Decode(message) => MemoryStoreError::Decode(message),
        }
    }
}

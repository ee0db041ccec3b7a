//! Chat Persistence
//!
//! The conductor reads history, conversation metadata and per-user settings
//! through [`ChatStore`] and writes user and assistant turns back. The crate
//! ships an in-memory store; a database-backed store implements the same
//! trait.

mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;

use crate::messages::{
    Conversation, ConversationId, SearchSettings, StoredMessage, UserId, UserPreferences,
};

/// Errors raised by a [`ChatStore`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The conversation does not exist
    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),

    /// The underlying storage failed
    #[error("storage failure: {0}")]
    Backend(String),
}

/// Persistence seam for conversations, messages and user settings
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Create a conversation owned by `owner`
    async fn create_conversation(
        &self,
        owner: &UserId,
        title: &str,
        model: Option<String>,
    ) -> Result<Conversation, StoreError>;

    /// Look up a conversation
    async fn conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError>;

    /// Conversations owned by `owner`, most recently updated first
    async fn list_conversations(&self, owner: &UserId) -> Result<Vec<Conversation>, StoreError>;

    /// Append a message to its conversation
    async fn append_message(&self, message: StoredMessage) -> Result<(), StoreError>;

    /// All messages of a conversation in creation order
    async fn messages(&self, id: &ConversationId) -> Result<Vec<StoredMessage>, StoreError>;

    /// Set the conversation's last-modified time to now
    async fn touch_conversation(&self, id: &ConversationId) -> Result<(), StoreError>;

    /// Remember the model last used in a conversation
    async fn set_conversation_model(
        &self,
        id: &ConversationId,
        model: &str,
    ) -> Result<(), StoreError>;

    /// Personalization settings; defaults when the user has none
    async fn user_preferences(&self, user: &UserId) -> Result<UserPreferences, StoreError>;

    /// Web search settings; defaults when the user has none
    async fn search_settings(&self, user: &UserId) -> Result<SearchSettings, StoreError>;
}

//! In-memory [`ChatStore`]

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{ChatStore, StoreError};
use crate::messages::{
    Conversation, ConversationId, SearchSettings, StoredMessage, UserId, UserPreferences,
};

#[derive(Debug, Default)]
struct MemoryInner {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<StoredMessage>>,
    preferences: HashMap<UserId, UserPreferences>,
    search: HashMap<UserId, SearchSettings>,
}

/// Process-local store backed by hash maps
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a user's personalization settings
    pub fn set_preferences(&self, user: &UserId, preferences: UserPreferences) {
        self.inner.write().preferences.insert(user.clone(), preferences);
    }

    /// Set a user's web search settings
    pub fn set_search_settings(&self, user: &UserId, settings: SearchSettings) {
        self.inner.write().search.insert(user.clone(), settings);
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_conversation(
        &self,
        owner: &UserId,
        title: &str,
        model: Option<String>,
    ) -> Result<Conversation, StoreError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::generate(),
            owner: owner.clone(),
            title: title.to_string(),
            model,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.write();
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        inner.messages.insert(conversation.id.clone(), Vec::new());
        Ok(conversation)
    }

    async fn conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        Ok(self.inner.read().conversations.get(id).cloned())
    }

    async fn list_conversations(&self, owner: &UserId) -> Result<Vec<Conversation>, StoreError> {
        let mut owned: Vec<Conversation> = self
            .inner
            .read()
            .conversations
            .values()
            .filter(|c| &c.owner == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(owned)
    }

    async fn append_message(&self, message: StoredMessage) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let messages = inner
            .messages
            .get_mut(&message.conversation_id)
            .ok_or_else(|| StoreError::ConversationNotFound(message.conversation_id.clone()))?;
        messages.push(message);
        Ok(())
    }

    async fn messages(&self, id: &ConversationId) -> Result<Vec<StoredMessage>, StoreError> {
        let mut messages = self
            .inner
            .read()
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))?;
        // Stable: equal timestamps keep insertion order
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn touch_conversation(&self, id: &ConversationId) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let conversation = inner
            .conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))?;
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn set_conversation_model(
        &self,
        id: &ConversationId,
        model: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let conversation = inner
            .conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::ConversationNotFound(id.clone()))?;
        conversation.model = Some(model.to_string());
        Ok(())
    }

    async fn user_preferences(&self, user: &UserId) -> Result<UserPreferences, StoreError> {
        Ok(self
            .inner
            .read()
            .preferences
            .get(user)
            .cloned()
            .unwrap_or_default())
    }

    async fn search_settings(&self, user: &UserId) -> Result<SearchSettings, StoreError> {
        Ok(self.inner.read().search.get(user).cloned().unwrap_or_default())
    }
}

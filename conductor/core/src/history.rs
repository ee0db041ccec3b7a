//! History Assembler
//!
//! Builds the ordered message list sent to the backend for one turn:
//!
//! ```text
//! [stored system messages] [personalization] [search block*] [last N turns] [new turn]
//! ```
//!
//! (*) the search block is appended to the system group afterwards by
//! [`AssembledHistory::push_system`].
//!
//! System messages always precede every non-system message. Only the
//! non-system group is truncated; system messages are never dropped.
//! Documents are flattened into the text of their message and images are
//! carried in the backend's `images` field.

use std::sync::Arc;

use crate::backend::ChatMessage;
use crate::messages::{
    ConversationId, Document, MessageRole, NewTurn, StoredMessage, UserPreferences,
};
use crate::store::{ChatStore, StoreError};

/// Marker appended to a document that was cut short
pub const TRUNCATION_MARKER: &str = "...\n[document truncated]";

// ============================================================================
// Pure helpers
// ============================================================================

/// Messages split into the system group and the conversational turns
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionedHistory {
    system: Vec<ChatMessage>,
    turns: Vec<ChatMessage>,
}

impl PartitionedHistory {
    /// Split `messages`, preserving relative order within each group
    pub fn partition<I>(messages: I) -> Self
    where
        I: IntoIterator<Item = ChatMessage>,
    {
        let (system, turns): (Vec<_>, Vec<_>) =
            messages.into_iter().partition(ChatMessage::is_system);
        Self { system, turns }
    }

    /// Keep only the most recent `max_turns` non-system messages
    pub fn truncate_turns(&mut self, max_turns: usize) {
        let excess = self.turns.len().saturating_sub(max_turns);
        self.turns.drain(..excess);
    }

    /// Append to the end of the system group
    pub fn push_system(&mut self, message: ChatMessage) {
        self.system.push(message);
    }

    /// Append to the end of the turns
    pub fn push_turn(&mut self, message: ChatMessage) {
        self.turns.push(message);
    }

    /// System messages
    #[must_use]
    pub fn system(&self) -> &[ChatMessage] {
        &self.system
    }

    /// Non-system messages
    #[must_use]
    pub fn turns(&self) -> &[ChatMessage] {
        &self.turns
    }

    /// Concatenate: system group first, then turns
    #[must_use]
    pub fn into_messages(self) -> Vec<ChatMessage> {
        let mut messages = self.system;
        messages.extend(self.turns);
        messages
    }
}

/// Append `document` to `content`, truncating the document text to
/// `max_chars` characters.
#[must_use]
pub fn flatten_document(content: &str, document: &Document, max_chars: usize) -> String {
    let body = match document.content.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &document.content[..cut]),
        None => document.content.clone(),
    };
    format!(
        "{content}\n\nContent of document {}:\n{body}",
        document.name
    )
}

/// Convert a stored message into backend format
#[must_use]
pub fn to_chat_message(message: &StoredMessage, max_document_chars: usize) -> ChatMessage {
    let content = match &message.document {
        Some(doc) => flatten_document(&message.content, doc, max_document_chars),
        None => message.content.clone(),
    };
    let chat = ChatMessage::new(message.role, content);
    match &message.image {
        Some(image) => chat.with_image(image.clone()),
        None => chat,
    }
}

/// The system message describing the user, if personalization applies
#[must_use]
pub fn personalization_message(preferences: &UserPreferences) -> Option<ChatMessage> {
    if !preferences.use_personal_info {
        return None;
    }
    let info = preferences.personal_info.as_deref()?.trim();
    if info.is_empty() {
        return None;
    }

    let info = match preferences.nickname.as_deref().map(str::trim) {
        Some(nickname) if !nickname.is_empty() && !mentions_name(info, nickname) => {
            format!("My name is {nickname}. {info}")
        }
        _ => info.to_string(),
    };
    Some(ChatMessage::system(format!(
        "User's personal information: {info}"
    )))
}

fn mentions_name(info: &str, nickname: &str) -> bool {
    info.to_lowercase().contains(&nickname.to_lowercase())
}

// ============================================================================
// Assembler
// ============================================================================

/// History ready to be sent, still open for extra system messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledHistory {
    history: PartitionedHistory,
    new_turn: ChatMessage,
}

impl AssembledHistory {
    /// Add a system message at the end of the system group
    pub fn push_system(&mut self, message: ChatMessage) {
        self.history.push_system(message);
    }

    /// The user turn that was persisted
    #[must_use]
    pub fn new_turn(&self) -> &ChatMessage {
        &self.new_turn
    }

    /// Final ordered message list
    #[must_use]
    pub fn into_messages(self) -> Vec<ChatMessage> {
        let mut history = self.history;
        history.push_turn(self.new_turn);
        history.into_messages()
    }
}

/// Loads, shapes and persists conversation history
pub struct HistoryAssembler {
    store: Arc<dyn ChatStore>,
    max_turns: usize,
    max_document_chars: usize,
}

impl HistoryAssembler {
    /// Create an assembler keeping `max_turns` prior non-system turns
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>, max_turns: usize, max_document_chars: usize) -> Self {
        Self {
            store,
            max_turns,
            max_document_chars,
        }
    }

    /// Assemble the prompt for `new_turn` and persist the turn.
    ///
    /// The user turn is stored before this returns, so it survives a later
    /// routing or backend failure.
    ///
    /// # Errors
    ///
    /// Returns the store's error if history cannot be read or the new turn
    /// cannot be written.
    pub async fn assemble(
        &self,
        conversation_id: &ConversationId,
        new_turn: NewTurn,
        preferences: &UserPreferences,
    ) -> Result<AssembledHistory, StoreError> {
        let stored = self.store.messages(conversation_id).await?;
        let mut history = PartitionedHistory::partition(
            stored
                .iter()
                .map(|m| to_chat_message(m, self.max_document_chars)),
        );

        if let Some(personal) = personalization_message(preferences) {
            history.push_system(personal);
        }
        history.truncate_turns(self.max_turns);

        let record = StoredMessage {
            image: new_turn.image,
            document: new_turn.document,
            ..StoredMessage::new(conversation_id.clone(), MessageRole::User, new_turn.content)
        };
        let new_turn = to_chat_message(&record, self.max_document_chars);
        self.store.append_message(record).await?;

        tracing::debug!(
            conversation_id = %conversation_id,
            system = history.system().len(),
            turns = history.turns().len(),
            "History assembled"
        );

        Ok(AssembledHistory { history, new_turn })
    }
}

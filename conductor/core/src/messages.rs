//! Conversation Domain Types
//!
//! Identifiers, persisted messages, conversations and per-user settings shared
//! by the history assembler, the search augmenter, the store and the transports.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque conversation identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Generate a fresh random identifier
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque user identifier, produced by an [`crate::auth::Authenticator`]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Borrow the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Role of a message in a conversation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions for the model
    System,
    /// Human turn
    User,
    /// Model turn
    Assistant,
}

impl MessageRole {
    /// Wire name of the role
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document attached to a user turn
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Display name (usually the file name)
    pub name: String,
    /// Extracted text content
    pub content: String,
    /// MIME type as reported by the client
    #[serde(rename = "type", default)]
    pub mime_type: String,
}

impl Document {
    /// Parse a raw document string.
    ///
    /// Clients sometimes send a document as plain text with a leading
    /// `# File: <name>` header instead of a structured object.
    #[must_use]
    pub fn from_raw(raw: &str) -> Self {
        let (name, content) = match raw.strip_prefix("# File: ") {
            Some(rest) => match rest.split_once('\n') {
                Some((name, content)) => (name.trim().to_string(), content.to_string()),
                None => (rest.trim().to_string(), String::new()),
            },
            None => ("Unnamed document".to_string(), raw.to_string()),
        };
        Self {
            name,
            content,
            mime_type: "text/plain".to_string(),
        }
    }
}

/// Either shape a client may use for an attached document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentPayload {
    /// `{name, content, type}`
    Structured(Document),
    /// Plain text, optionally with a `# File:` header
    Raw(String),
}

impl DocumentPayload {
    /// Normalize into a [`Document`]
    #[must_use]
    pub fn into_document(self) -> Document {
        match self {
            Self::Structured(doc) => doc,
            Self::Raw(raw) => Document::from_raw(&raw),
        }
    }
}

/// A message as persisted in a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Owning conversation
    pub conversation_id: ConversationId,
    /// Message role
    pub role: MessageRole,
    /// Text content
    pub content: String,
    /// Base64 image attachment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Document attachment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<Document>,
    /// Creation time, used for ordering
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Create a text message stamped with the current time
    pub fn new(
        conversation_id: ConversationId,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id,
            role,
            content: content.into(),
            image: None,
            document: None,
            created_at: Utc::now(),
        }
    }
}

/// The user turn that starts a chat exchange
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NewTurn {
    /// Text the user typed
    pub content: String,
    /// Base64 image attachment
    pub image: Option<String>,
    /// Document attachment
    pub document: Option<Document>,
}

impl NewTurn {
    /// A plain text turn
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

// ============================================================================
// Conversations and user settings
// ============================================================================

/// Conversation metadata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Identifier
    pub id: ConversationId,
    /// Owning user
    pub owner: UserId,
    /// Display title
    pub title: String,
    /// Model last selected for this conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

/// Per-user personalization
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    /// Whether personal info is injected into prompts
    #[serde(default = "default_true")]
    pub use_personal_info: bool,
    /// Free-form text about the user
    #[serde(default)]
    pub personal_info: Option<String>,
    /// Name the user wants to be called
    #[serde(default)]
    pub nickname: Option<String>,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            use_personal_info: true,
            personal_info: None,
            nickname: None,
        }
    }
}

/// Per-user web search settings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchSettings {
    /// User-provided search API key
    #[serde(default)]
    pub api_key: Option<String>,
    /// `basic` or `advanced`
    #[serde(default)]
    pub search_depth: Option<String>,
    /// Domains to restrict results to
    #[serde(default)]
    pub include_domains: Vec<String>,
    /// Domains to drop from results
    #[serde(default)]
    pub exclude_domains: Vec<String>,
}

//! LLM Backend Traits
//!
//! Trait definitions for chat backends. The router, the priming step and the
//! stream orchestrator only talk to [`LlmBackend`], so tests can substitute a
//! scripted backend and production uses [`super::OllamaBackend`].
//!
//! # Wire model
//!
//! A chat request carries a model name and an ordered message list. Streaming
//! responses arrive as [`ChatFrame`]s (one JSON object per line); the backend
//! implementation turns them into [`StreamingToken`]s on an mpsc channel.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::messages::MessageRole;

/// Prompt used to force a model into backend memory
pub const PRIMING_PROMPT: &str = "Hello";

/// Token stream events from LLM backends
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamingToken {
    /// A content fragment from the response
    Token(String),
    /// Response completed successfully
    Complete {
        /// The complete message (concatenation of all fragments)
        message: String,
    },
    /// Error occurred during streaming
    Error(String),
}

/// A single chat message in backend format
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role
    pub role: MessageRole,
    /// Text content
    #[serde(default)]
    pub content: String,
    /// Base64 images attached to this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ChatMessage {
    /// Create a message with the given role
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: None,
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Attach an image
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.images.get_or_insert_with(Vec::new).push(image.into());
        self
    }

    /// Whether this is a system message
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.role == MessageRole::System
    }
}

/// Chat request sent to a backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    /// Backend model identifier
    pub model: String,
    /// Ordered message list
    pub messages: Vec<ChatMessage>,
    /// Whether the backend should stream frames
    pub stream: bool,
}

impl ChatRequest {
    /// A streaming request
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
        }
    }

    /// The single-turn, non-streaming request used to load a model
    pub fn priming(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::user(PRIMING_PROMPT)],
            stream: false,
        }
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// One decoded frame of a backend chat response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFrame {
    /// Model that produced the frame
    #[serde(default)]
    pub model: String,
    /// Message fragment (absent on some terminal frames)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    /// True on the last frame
    #[serde(default)]
    pub done: bool,
    /// Error reported in-band by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatFrame {
    /// Text carried by this frame, empty when there is none
    #[must_use]
    pub fn content(&self) -> &str {
        self.message.as_ref().map_or("", |m| m.content.as_str())
    }
}

/// Response from a non-streaming chat request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LlmResponse {
    /// The response text
    pub content: String,
    /// Model that generated the response
    pub model: String,
    /// Response time in milliseconds
    pub duration_ms: Option<u64>,
}

/// Errors raised by backend calls
#[derive(Debug, Error)]
pub enum BackendError {
    /// The HTTP client could not be constructed
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    /// The backend could not be reached or the connection dropped
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend answered with a non-success status
    #[error("backend returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// A frame could not be decoded
    #[error("malformed backend frame: {0}")]
    MalformedFrame(String),

    /// The backend reported an error in-band
    #[error("backend error: {0}")]
    Remote(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        Self::Unreachable(err.to_string())
    }
}

/// LLM Backend trait
///
/// Implement this trait to add support for different chat providers.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Get the backend name (e.g., "Ollama")
    fn name(&self) -> &str;

    /// Check if the backend is reachable
    async fn health_check(&self) -> bool;

    /// Send a chat request and receive fragments on a channel.
    ///
    /// The channel closes after exactly one terminal event
    /// ([`StreamingToken::Complete`] or [`StreamingToken::Error`]), or early
    /// when the receiver is dropped.
    async fn chat_streaming(
        &self,
        request: &ChatRequest,
    ) -> Result<mpsc::Receiver<StreamingToken>, BackendError>;

    /// Send a chat request and wait for the full response
    async fn chat(&self, request: &ChatRequest) -> Result<LlmResponse, BackendError>;
}

//! Wire Frames
//!
//! JSON shapes exchanged with clients over both transports.
//!
//! # Streaming HTTP
//!
//! ```text
//! {"model":"llama2","message":{"role":"assistant","content":"Hel"},"done":false}\n
//! {"model":"llama2","message":{"role":"assistant","content":"lo"},"done":false}\n
//! {"model":"llama2","message":{"role":"assistant","content":""},"done":true}\n
//! ```
//!
//! # Duplex channel
//!
//! ```text
//! client -> {"type":"chat","messages":[...],"model":"llama2","searchEnabled":true}
//! server <- {"type":"model_loading","status":"loading","message":"...","progress":0,"model":"llama2"}
//! server <- {"message":{"content":"Hel"}}
//! server <- {"done":true}           or  {"error":"..."}
//! ```

use axum::body::Bytes;
use serde::{Deserialize, Serialize};

use crate::conductor::{ConductorError, TurnRequest};
use crate::messages::{DocumentPayload, MessageRole, NewTurn};
use crate::routing::ModelLoadEvent;
use crate::streaming::StreamChunk;

// ============================================================================
// Client frames
// ============================================================================

/// A message in a client request
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct WireMessage {
    /// Author role
    pub role: MessageRole,
    /// Text
    #[serde(default)]
    pub content: String,
    /// Base64 image
    #[serde(default)]
    pub image: Option<String>,
    /// Attached document, structured or raw
    #[serde(default)]
    pub document: Option<DocumentPayload>,
}

/// Extract the new user turn from a client message list.
///
/// Prior messages are ignored; history comes from persistence. The last
/// message must be a non-empty user turn.
///
/// # Errors
///
/// Returns [`ConductorError::InvalidRequest`] otherwise.
pub fn new_turn(messages: Vec<WireMessage>) -> Result<NewTurn, ConductorError> {
    let last = messages
        .into_iter()
        .last()
        .ok_or_else(|| ConductorError::InvalidRequest("messages must not be empty".into()))?;

    if last.role != MessageRole::User {
        return Err(ConductorError::InvalidRequest(format!(
            "last message must have role user, got {}",
            last.role
        )));
    }
    if last.content.trim().is_empty() && last.image.is_none() && last.document.is_none() {
        return Err(ConductorError::InvalidRequest(
            "last message has no content".into(),
        ));
    }

    Ok(NewTurn {
        content: last.content,
        image: last.image,
        document: last.document.map(DocumentPayload::into_document),
    })
}

/// Body of `POST /api/conversations/:id/chat`
#[derive(Clone, Debug, Deserialize)]
pub struct HttpChatRequest {
    /// Message list; the last one is the new turn
    pub messages: Vec<WireMessage>,
    /// Model override
    #[serde(default)]
    pub model: Option<String>,
    /// Stream NDJSON instead of returning one JSON body
    #[serde(default)]
    pub stream: bool,
    /// Augment with web search
    #[serde(default, rename = "searchEnabled", alias = "web_search")]
    pub search_enabled: bool,
}

impl HttpChatRequest {
    /// Convert into a turn request
    ///
    /// # Errors
    ///
    /// Returns [`ConductorError::InvalidRequest`] for a malformed message list.
    pub fn into_turn_request(self) -> Result<TurnRequest, ConductorError> {
        Ok(TurnRequest {
            model: self.model,
            turn: new_turn(self.messages)?,
            web_search: self.search_enabled,
        })
    }
}

/// Frames a duplex client may send
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start a turn
    Chat {
        /// Message list; the last one is the new turn
        messages: Vec<WireMessage>,
        /// Model override
        #[serde(default)]
        model: Option<String>,
        /// Augment with web search
        #[serde(default, rename = "searchEnabled", alias = "web_search")]
        search_enabled: bool,
    },
}

impl ClientFrame {
    /// Convert into a turn request
    ///
    /// # Errors
    ///
    /// Returns [`ConductorError::InvalidRequest`] for a malformed message list.
    pub fn into_turn_request(self) -> Result<TurnRequest, ConductorError> {
        match self {
            Self::Chat {
                messages,
                model,
                search_enabled,
            } => Ok(TurnRequest {
                model,
                turn: new_turn(messages)?,
                web_search: search_enabled,
            }),
        }
    }
}

// ============================================================================
// Server frames
// ============================================================================

/// Content of an incremental duplex frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContentBody {
    /// Text fragment
    pub content: String,
}

/// Model load notification on the duplex channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModelLoadingFrame {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    event: ModelLoadEvent,
}

/// Frames sent to a duplex client
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// Reply fragment
    Content {
        /// Fragment
        message: ContentBody,
    },
    /// Turn completed
    Done {
        /// Always true
        done: bool,
    },
    /// Turn failed
    Error {
        /// Failure description
        error: String,
    },
    /// Routing progress
    ModelLoading(ModelLoadingFrame),
}

impl ServerFrame {
    /// Serialize to a text frame payload
    ///
    /// # Errors
    ///
    /// Returns the serializer's error.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<StreamChunk> for ServerFrame {
    fn from(chunk: StreamChunk) -> Self {
        match chunk.error {
            Some(error) => Self::Error { error },
            None if chunk.done => Self::Done { done: true },
            None => Self::Content {
                message: ContentBody {
                    content: chunk.message.content,
                },
            },
        }
    }
}

impl From<ModelLoadEvent> for ServerFrame {
    fn from(event: ModelLoadEvent) -> Self {
        Self::ModelLoading(ModelLoadingFrame {
            kind: "model_loading",
            event,
        })
    }
}

/// Encode a chunk as one NDJSON line
#[must_use]
pub fn ndjson_line(chunk: &StreamChunk) -> Bytes {
    match serde_json::to_vec(chunk) {
        Ok(mut line) => {
            line.push(b'\n');
            Bytes::from(line)
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode stream chunk");
            Bytes::from_static(b"{\"error\":\"failed to encode chunk\",\"done\":true}\n")
        }
    }
}

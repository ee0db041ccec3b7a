//! LLM Backend Integration
//!
//! This module provides abstracted access to chat backends through a common
//! trait interface.
//!
//! # Available Backends
//!
//! - **Ollama**: Local LLM server (default)
//!
//! # Usage
//!
//! ```ignore
//! use conductor_core::backend::{ChatMessage, ChatRequest, LlmBackend, OllamaBackend};
//! use std::time::Duration;
//!
//! let backend = OllamaBackend::new(
//!     "http://localhost:11434",
//!     Duration::from_secs(5),
//!     Duration::from_secs(1800),
//! )?;
//! let request = ChatRequest::new("llama2", vec![ChatMessage::user("Hello!")]);
//! let rx = backend.chat_streaming(&request).await?;
//! ```

mod ollama;
mod traits;

pub use ollama::{FrameDecoder, OllamaBackend};
pub(crate) use ollama::truncate_error_body;
pub use traits::{
    BackendError, ChatFrame, ChatMessage, ChatRequest, LlmBackend, LlmResponse, StreamingToken,
    PRIMING_PROMPT,
};

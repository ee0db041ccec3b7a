//! Conductor Core - Streaming Orchestration for a Multi-User Chat Backend
//!
//! This crate turns a chat turn into a stream of model output. It decides
//! which backend connection serves a model, loads models on demand, builds
//! the prompt from stored history, optionally augments it with web search,
//! streams the reply to the client, persists it, and lets a turn be stopped
//! from outside.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Client Transports                          │
//! │   ┌──────────────────┐  ┌──────────────────┐  ┌───────────────┐  │
//! │   │  HTTP (NDJSON)   │  │ WebSocket session │  │ Abort request │  │
//! │   └────────┬─────────┘  └────────┬─────────┘  └───────┬───────┘  │
//! └────────────┼─────────────────────┼────────────────────┼──────────┘
//!              │                     │                    │
//! ┌────────────┼─────────────────────┼────────────────────┼──────────┐
//! │            ▼          CONDUCTOR  ▼                    ▼          │
//! │   ┌────────────────┐  ┌────────────────┐  ┌──────────────────┐   │
//! │   │    History     │  │     Search     │  │ Session Registry │   │
//! │   │   Assembler    │  │   Augmenter    │  │  (cancellation)  │   │
//! │   └───────┬────────┘  └───────┬────────┘  └──────────────────┘   │
//! │           └─────────┬─────────┘                                  │
//! │                     ▼                                            │
//! │           ┌──────────────────┐      ┌──────────────────────┐     │
//! │           │ Stream           │─────►│ Model Router         │     │
//! │           │ Orchestrator     │      │ + Connection Pool    │     │
//! │           └──────────────────┘      └──────────┬───────────┘     │
//! └────────────────────────────────────────────────┼─────────────────┘
//!                                                  ▼
//!                                     Inference backend (Ollama)
//! ```
//!
//! # Key Types
//!
//! - [`Conductor`]: Long-lived context shared by every request
//! - [`ModelRouter`]: Maps a model to a ready connection, loading on demand
//! - [`HistoryAssembler`]: Builds the ordered prompt for a turn
//! - [`SearchAugmenter`]: Web search with credential fallback
//! - [`StreamOrchestrator`]: Drives one turn from routing to persistence
//! - [`SessionRegistry`]: Live duplex session per conversation
//!
//! # Module Overview
//!
//! - [`auth`]: Credential resolution
//! - [`backend`]: Inference backend abstraction (Ollama)
//! - [`conductor`]: The shared context and top-level error
//! - [`config`]: TOML, environment and CLI configuration
//! - [`history`]: Prompt assembly
//! - [`messages`]: Domain types
//! - [`routing`]: Connection pool and model router
//! - [`search`]: Web search augmentation
//! - [`session_registry`]: Live sessions and abort
//! - [`store`]: Persistence seam and in-memory store
//! - [`streaming`]: Turn state machine
//! - [`transport`]: HTTP and WebSocket surfaces (axum)

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod backend;
pub mod conductor;
pub mod config;
pub mod history;
pub mod messages;
pub mod routing;
pub mod search;
pub mod session_registry;
pub mod store;
pub mod streaming;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports for convenience
pub use auth::{AuthError, Authenticator, StaticTokenAuthenticator};
pub use backend::{
    BackendError, ChatMessage, ChatRequest, LlmBackend, LlmResponse, OllamaBackend,
    StreamingToken,
};
pub use conductor::{Conductor, ConductorError, ConductorParts, TurnRequest};
pub use history::{AssembledHistory, HistoryAssembler};
pub use messages::{
    Conversation, ConversationId, Document, MessageRole, NewTurn, SearchSettings, StoredMessage,
    UserId, UserPreferences,
};

// Routing exports
pub use routing::{
    ConnectionPool, EvictionPolicy, LoadStatus, ModelLoadEvent, ModelRouter, PoolStats,
    ProgressSink, RouterError,
};

// Search exports
pub use search::{
    Augmentation, SearchAugmenter, SearchError, SearchProvider, SearchQuery, SearchResult,
    TavilyClient,
};

// Session exports
pub use session_registry::{AbortOutcome, CloseReason, SessionId, SessionRegistry};

// Store exports
pub use store::{ChatStore, MemoryStore, StoreError};

// Streaming exports
pub use streaming::{
    PartialOutput, PreparedTurn, StreamChunk, StreamOrchestrator, TurnOutcome, TurnState,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConductorConfig, ConductorToml,
    ConfigError, ConfigOverrides, ConfigSource, ConfigSources,
};

//! Streaming Turn Execution
//!
//! The [`StreamOrchestrator`] owns a turn from routing to persistence and
//! emits [`StreamChunk`]s on an mpsc channel. Transports decide how chunks
//! reach the client (NDJSON body or WebSocket frames).

pub mod orchestrator;

pub use orchestrator::{
    PartialOutput, PreparedTurn, StreamChunk, StreamOrchestrator, TurnOutcome, TurnState,
};

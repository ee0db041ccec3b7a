//! Stream Orchestrator
//!
//! Runs one chat turn: route to a connection, open the backend stream,
//! forward fragments to the client sink, then persist the reply.
//!
//! # Turn lifecycle
//!
//! ```text
//!   Idle ──route──> Routed ──open──> Streaming ──done──> Completed
//!    │                │                  │
//!    │ route error    │ open error       │ backend error
//!    └──────────┐     ├──────────┐       ├─────────────> Failed
//!               v     v          │       │ sink closed
//!             Failed         Aborted <───┘
//! ```
//!
//! Cancellation is cooperative. Closing the sink (the client went away, or
//! the session was aborted) is observed at the next fragment boundary. The
//! backend receiver is then dropped, which stops the backend reader task the
//! next time it tries to forward a frame. The backend itself is not told to
//! stop generating.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backend::{ChatMessage, ChatRequest, StreamingToken};
use crate::messages::{ConversationId, MessageRole, StoredMessage};
use crate::routing::{ModelRouter, ProgressSink};
use crate::store::ChatStore;

// ============================================================================
// Types
// ============================================================================

/// States of a single turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Nothing has happened yet
    Idle,
    /// A connection with the model loaded was obtained
    Routed,
    /// Backend fragments are flowing
    Streaming,
    /// The backend finished and the reply was persisted
    Completed,
    /// Routing or the backend failed
    Failed,
    /// The sink closed before completion
    Aborted,
}

/// What to do with output produced before an abort or failure
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PartialOutput {
    /// Store the partial reply as the assistant message
    Persist,
    /// Drop it
    #[default]
    Discard,
}

/// One frame delivered to the client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Model producing the reply
    pub model: String,
    /// Reply fragment
    pub message: ChatMessage,
    /// True on the final frame
    pub done: bool,
    /// Set on a terminal error frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamChunk {
    /// A content fragment
    pub fn content(model: &str, text: impl Into<String>) -> Self {
        Self {
            model: model.to_string(),
            message: ChatMessage::assistant(text),
            done: false,
            error: None,
        }
    }

    /// The final frame of a completed turn
    #[must_use]
    pub fn done(model: &str) -> Self {
        Self {
            model: model.to_string(),
            message: ChatMessage::assistant(""),
            done: true,
            error: None,
        }
    }

    /// The terminal frame of a failed turn
    #[must_use]
    pub fn error(model: &str, error: &str) -> Self {
        Self {
            model: model.to_string(),
            message: ChatMessage::assistant(format!(
                "Sorry, an error occurred while processing your request: {error}"
            )),
            done: true,
            error: Some(error.to_string()),
        }
    }

    /// Whether this is an error frame
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Everything needed to stream one turn
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedTurn {
    /// Conversation receiving the reply
    pub conversation_id: ConversationId,
    /// Model to route to
    pub model: String,
    /// Full prompt, system messages first
    pub messages: Vec<ChatMessage>,
}

/// How a turn ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Terminal state
    pub state: TurnState,
    /// Reply text produced (possibly partial)
    pub content: String,
    /// Failure description
    pub error: Option<String>,
    /// Whether an assistant message was stored
    pub persisted: bool,
    /// Connection used, if routing succeeded
    pub connection: Option<usize>,
}

// ============================================================================
// Orchestrator
// ============================================================================

struct Turn<'a> {
    conversation_id: &'a ConversationId,
    model: &'a str,
    state: TurnState,
    content: String,
    error: Option<String>,
    connection: Option<usize>,
}

impl Turn<'_> {
    fn advance(&mut self, next: TurnState) {
        tracing::debug!(
            conversation_id = %self.conversation_id,
            model = self.model,
            from = ?self.state,
            to = ?next,
            "Turn state"
        );
        self.state = next;
    }

    fn fail(&mut self, error: String) {
        self.error = Some(error);
        self.advance(TurnState::Failed);
    }
}

/// Drives turns from routing to persistence
pub struct StreamOrchestrator {
    router: Arc<ModelRouter>,
    store: Arc<dyn ChatStore>,
}

impl StreamOrchestrator {
    /// Create an orchestrator
    #[must_use]
    pub fn new(router: Arc<ModelRouter>, store: Arc<dyn ChatStore>) -> Self {
        Self { router, store }
    }

    /// Run `turn`, forwarding frames into `sink`.
    ///
    /// Exactly one terminal frame (done or error) is sent unless the sink
    /// closes first. The sink is dropped when this returns, after any
    /// persistence, which is how the consumer learns the turn is over.
    pub async fn run(
        &self,
        turn: PreparedTurn,
        sink: mpsc::Sender<StreamChunk>,
        progress: Option<&dyn ProgressSink>,
        partial: PartialOutput,
    ) -> TurnOutcome {
        let mut state = Turn {
            conversation_id: &turn.conversation_id,
            model: &turn.model,
            state: TurnState::Idle,
            content: String::new(),
            error: None,
            connection: None,
        };

        self.stream(&mut state, &turn.messages, &sink, progress).await;

        if let Some(ref error) = state.error {
            if !sink.is_closed() {
                let _ = sink.send(StreamChunk::error(&turn.model, error)).await;
            }
        }

        let keep = match state.state {
            TurnState::Completed => true,
            _ => partial == PartialOutput::Persist,
        };
        let persisted = keep && self.persist_reply(&turn.conversation_id, &state.content).await;

        tracing::info!(
            conversation_id = %turn.conversation_id,
            model = %turn.model,
            state = ?state.state,
            chars = state.content.len(),
            persisted,
            "Turn finished"
        );

        TurnOutcome {
            state: state.state,
            content: state.content,
            error: state.error,
            persisted,
            connection: state.connection,
        }
    }

    async fn stream(
        &self,
        turn: &mut Turn<'_>,
        messages: &[ChatMessage],
        sink: &mpsc::Sender<StreamChunk>,
        progress: Option<&dyn ProgressSink>,
    ) {
        // Routing is not cancelled on abort so a half-primed binding is never
        // left behind; the abort is honored right after.
        let routed = match self.router.acquire(turn.model, progress).await {
            Ok(routed) => routed,
            Err(e) => return turn.fail(e.to_string()),
        };
        turn.connection = Some(routed.index());
        turn.advance(TurnState::Routed);

        if sink.is_closed() {
            return turn.advance(TurnState::Aborted);
        }

        let guard = tokio::select! {
            biased;
            () = sink.closed() => return turn.advance(TurnState::Aborted),
            guard = routed.acquire() => match guard {
                Ok(guard) => guard,
                Err(e) => return turn.fail(e.to_string()),
            },
        };

        let request = ChatRequest::new(turn.model, messages.to_vec());
        let mut tokens = tokio::select! {
            biased;
            () = sink.closed() => return turn.advance(TurnState::Aborted),
            opened = guard.backend().chat_streaming(&request) => match opened {
                Ok(rx) => rx,
                Err(e) => return turn.fail(e.to_string()),
            },
        };
        turn.advance(TurnState::Streaming);

        loop {
            tokio::select! {
                biased;
                () = sink.closed() => return turn.advance(TurnState::Aborted),
                token = tokens.recv() => match token {
                    Some(StreamingToken::Token(text)) => {
                        turn.content.push_str(&text);
                        if sink.send(StreamChunk::content(turn.model, text)).await.is_err() {
                            return turn.advance(TurnState::Aborted);
                        }
                    }
                    Some(StreamingToken::Complete { message }) => {
                        if turn.content.is_empty() {
                            turn.content = message;
                        }
                        drop(guard);
                        if sink.send(StreamChunk::done(turn.model)).await.is_err() {
                            return turn.advance(TurnState::Aborted);
                        }
                        return turn.advance(TurnState::Completed);
                    }
                    Some(StreamingToken::Error(e)) => return turn.fail(e),
                    None => {
                        return turn.fail("backend stream ended unexpectedly".to_string());
                    }
                },
            }
        }
    }

    async fn persist_reply(&self, conversation_id: &ConversationId, content: &str) -> bool {
        if content.is_empty() {
            return false;
        }
        let message = StoredMessage::new(conversation_id.clone(), MessageRole::Assistant, content);
        if let Err(e) = self.store.append_message(message).await {
            tracing::error!(conversation_id = %conversation_id, error = %e, "Failed to persist reply");
            return false;
        }
        if let Err(e) = self.store.touch_conversation(conversation_id).await {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to update conversation time");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::UserId;
    use crate::store::MemoryStore;
    use crate::test_utils::{router_over, ScriptedBackend};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn setup(
        backend: ScriptedBackend,
    ) -> (StreamOrchestrator, Arc<MemoryStore>, PreparedTurn) {
        let backend = Arc::new(backend);
        let store = Arc::new(MemoryStore::new());
        let conv = store
            .create_conversation(&UserId::from("u"), "t", None)
            .await
            .unwrap();
        let orchestrator = StreamOrchestrator::new(router_over(&backend, 1), store.clone());
        let turn = PreparedTurn {
            conversation_id: conv.id,
            model: "llama2".into(),
            messages: vec![ChatMessage::user("hi")],
        };
        (orchestrator, store, turn)
    }

    #[tokio::test]
    async fn test_completed_turn_streams_and_persists() {
        let (orchestrator, store, turn) = setup(ScriptedBackend::default()).await;
        let (tx, mut rx) = mpsc::channel(16);
        let conv = turn.conversation_id.clone();

        let outcome = orchestrator
            .run(turn, tx, None, PartialOutput::Discard)
            .await;

        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(
            chunks,
            vec![
                StreamChunk::content("llama2", "Hel"),
                StreamChunk::content("llama2", "lo"),
                StreamChunk::done("llama2"),
            ]
        );
        assert_eq!(outcome.state, TurnState::Completed);
        assert!(outcome.persisted);

        let stored = store.messages(&conv).await.unwrap();
        assert_eq!(stored.last().unwrap().content, "Hello");
        assert_eq!(stored.last().unwrap().role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn test_backend_error_sends_single_error_frame() {
        let (orchestrator, store, turn) = setup(ScriptedBackend {
            fail_stream: Some("connection refused".into()),
            ..Default::default()
        })
        .await;
        let (tx, mut rx) = mpsc::channel(16);
        let conv = turn.conversation_id.clone();

        let outcome = orchestrator.run(turn, tx, None, PartialOutput::Persist).await;

        let chunk = rx.recv().await.unwrap();
        assert!(chunk.is_error());
        assert!(chunk.done);
        assert!(rx.recv().await.is_none());
        assert_eq!(outcome.state, TurnState::Failed);
        assert!(store.messages(&conv).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_routing_failure_fails_turn() {
        let mut backend = ScriptedBackend::default();
        backend.fail_prime.insert("llama2".into());
        let (orchestrator, _store, turn) = setup(backend).await;
        let (tx, mut rx) = mpsc::channel(16);

        let outcome = orchestrator.run(turn, tx, None, PartialOutput::Discard).await;
        assert_eq!(outcome.state, TurnState::Failed);
        assert_eq!(outcome.connection, None);
        assert!(rx.recv().await.unwrap().is_error());
    }

    #[tokio::test]
    async fn test_closed_sink_aborts_and_persists_partial() {
        let (orchestrator, store, turn) = setup(ScriptedBackend {
            fragments: (0..50).map(|i| format!("t{i} ")).collect(),
            token_delay: Duration::from_millis(10),
            ..Default::default()
        })
        .await;
        let (tx, mut rx) = mpsc::channel(16);
        let conv = turn.conversation_id.clone();

        let consumer = tokio::spawn(async move {
            // Read two fragments, then hang up
            rx.recv().await;
            rx.recv().await;
            drop(rx);
        });

        let outcome = orchestrator.run(turn, tx, None, PartialOutput::Persist).await;
        consumer.await.unwrap();

        assert_eq!(outcome.state, TurnState::Aborted);
        assert!(outcome.persisted);
        let stored = store.messages(&conv).await.unwrap();
        assert!(stored.last().unwrap().content.starts_with("t0 t1 "));
        assert!(!stored.last().unwrap().content.contains("t49"));
    }

    #[tokio::test]
    async fn test_closed_sink_discards_partial_when_asked() {
        let (orchestrator, store, turn) = setup(ScriptedBackend {
            fragments: (0..50).map(|i| format!("t{i} ")).collect(),
            token_delay: Duration::from_millis(10),
            ..Default::default()
        })
        .await;
        let (tx, mut rx) = mpsc::channel(16);
        let conv = turn.conversation_id.clone();

        let consumer = tokio::spawn(async move {
            rx.recv().await;
            drop(rx);
        });

        let outcome = orchestrator.run(turn, tx, None, PartialOutput::Discard).await;
        consumer.await.unwrap();

        assert_eq!(outcome.state, TurnState::Aborted);
        assert!(!outcome.persisted);
        assert!(store.messages(&conv).await.unwrap().is_empty());
    }

    #[test]
    fn test_chunk_wire_shape() {
        let json = serde_json::to_value(StreamChunk::content("m", "Hi")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "model": "m",
                "message": {"role": "assistant", "content": "Hi"},
                "done": false
            })
        );
    }
}

//! Session Registry - Live Duplex Sessions per Conversation
//!
//! Tracks the single live duplex session of each conversation so an abort
//! request arriving on another connection can reach it.
//!
//! # Architecture
//!
//! ```text
//!                      SessionRegistry
//!                     ┌──────────────────────────────────────────┐
//!                     │ HashMap<ConversationId, SessionHandle>   │
//!                     │   - wrapped in Arc<RwLock<>>             │
//!                     └───────────────┬──────────────────────────┘
//!                                     │  SessionControl::Close(reason)
//!              ┌──────────────────────┼──────────────────────┐
//!              │                      │                      │
//!       ┌──────▼──────┐       ┌───────▼──────┐       ┌───────▼──────┐
//!       │   conv A    │       │   conv B     │       │   conv C     │
//!       │  session-1  │       │  session-4   │       │  session-7   │
//!       └─────────────┘       └──────────────┘       └──────────────┘
//! ```
//!
//! The registry never touches the socket. It sends a close instruction on the
//! session's control channel and the session task performs the close, which
//! in turn drops the stream consumer and stops the turn.
//!
//! Registering a second session for a conversation supersedes the first: the
//! old session is told to close with [`CloseReason::Superseded`]. Unregister
//! only removes the entry if it still belongs to the caller's session, so a
//! superseded session finishing late cannot remove its replacement.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::messages::ConversationId;

/// Normal completion
pub const CLOSE_NORMAL: u16 = 1000;
/// Internal error
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Stopped by the user
pub const CLOSE_USER_ABORT: u16 = 4000;
/// Replaced by a newer session for the same conversation
pub const CLOSE_SUPERSEDED: u16 = 4001;

/// Why a session is being closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The turn finished
    Completed,
    /// An abort request was received
    UserAbort,
    /// A newer session registered for the same conversation
    Superseded,
    /// The turn failed
    Error,
}

impl CloseReason {
    /// WebSocket close code
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Completed => CLOSE_NORMAL,
            Self::UserAbort => CLOSE_USER_ABORT,
            Self::Superseded => CLOSE_SUPERSEDED,
            Self::Error => CLOSE_INTERNAL_ERROR,
        }
    }

    /// Close frame reason text
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::UserAbort => "user requested stop",
            Self::Superseded => "superseded by a newer session",
            Self::Error => "internal error",
        }
    }
}

/// Unique identifier for a duplex session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next session id
    #[must_use]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Instruction delivered to a session task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    /// Close the socket with this reason and stop the turn
    Close(CloseReason),
}

/// Registry-side handle to a live session
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    control: mpsc::Sender<SessionControl>,
}

impl SessionHandle {
    /// Create a handle and the receiver the session task listens on
    #[must_use]
    pub fn channel() -> (Self, mpsc::Receiver<SessionControl>) {
        let (control, rx) = mpsc::channel(4);
        let handle = Self {
            id: SessionId::next(),
            control,
        };
        (handle, rx)
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Ask the session to close. Returns false if it is already gone.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.control.try_send(SessionControl::Close(reason)).is_ok()
    }
}

/// Result of an abort request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// A live session was told to close
    Aborted,
    /// No session was registered
    NothingToAbort,
}

/// Conversation to live-session map
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<ConversationId, SessionHandle>>>,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.count())
            .finish()
    }
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for `conversation_id`, superseding any prior session
    pub fn register(&self, conversation_id: ConversationId, handle: SessionHandle) -> SessionId {
        let id = handle.id();
        let previous = self.inner.write().insert(conversation_id.clone(), handle);

        if let Some(old) = previous {
            old.close(CloseReason::Superseded);
            tracing::info!(
                conversation_id = %conversation_id,
                session_id = %old.id(),
                replaced_by = %id,
                "Session superseded"
            );
        }
        tracing::info!(conversation_id = %conversation_id, session_id = %id, "Session registered");
        id
    }

    /// Create a handle, register it and return the control receiver
    pub fn open(
        &self,
        conversation_id: ConversationId,
    ) -> (SessionId, mpsc::Receiver<SessionControl>) {
        let (handle, rx) = SessionHandle::channel();
        let id = self.register(conversation_id, handle);
        (id, rx)
    }

    /// Remove the entry for `conversation_id` if it belongs to `session_id`
    pub fn unregister(&self, conversation_id: &ConversationId, session_id: SessionId) -> bool {
        let mut sessions = self.inner.write();
        let owned = sessions
            .get(conversation_id)
            .is_some_and(|handle| handle.id() == session_id);
        if !owned {
            return false;
        }
        sessions.remove(conversation_id);
        drop(sessions);

        tracing::info!(
            conversation_id = %conversation_id,
            session_id = %session_id,
            "Session unregistered"
        );
        true
    }

    /// Close the live session of `conversation_id` with the user-abort code.
    ///
    /// Idempotent: a second call finds nothing and reports
    /// [`AbortOutcome::NothingToAbort`].
    pub fn abort(&self, conversation_id: &ConversationId) -> AbortOutcome {
        let removed = self.inner.write().remove(conversation_id);
        match removed {
            Some(handle) => {
                let delivered = handle.close(CloseReason::UserAbort);
                tracing::info!(
                    conversation_id = %conversation_id,
                    session_id = %handle.id(),
                    delivered,
                    "Session aborted"
                );
                AbortOutcome::Aborted
            }
            None => {
                tracing::debug!(conversation_id = %conversation_id, "No session to abort");
                AbortOutcome::NothingToAbort
            }
        }
    }

    /// Close every session, e.g. on shutdown
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<SessionHandle> = self.inner.write().drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.close(reason);
        }
        drained.len()
    }

    /// Number of registered sessions
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether `conversation_id` has a live session
    #[must_use]
    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.inner.read().contains_key(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("session-"));
    }

    #[tokio::test]
    async fn test_abort_sends_user_abort_and_removes() {
        let registry = SessionRegistry::new();
        let conv = ConversationId::from("c1");
        let (_id, mut rx) = registry.open(conv.clone());

        assert_eq!(registry.abort(&conv), AbortOutcome::Aborted);
        assert_eq!(
            rx.recv().await,
            Some(SessionControl::Close(CloseReason::UserAbort))
        );
        assert!(!registry.contains(&conv));
    }

    #[test]
    fn test_abort_is_idempotent() {
        let registry = SessionRegistry::new();
        let conv = ConversationId::from("c1");
        let (_id, _rx) = registry.open(conv.clone());

        assert_eq!(registry.abort(&conv), AbortOutcome::Aborted);
        assert_eq!(registry.abort(&conv), AbortOutcome::NothingToAbort);
        assert_eq!(
            registry.abort(&ConversationId::from("never")),
            AbortOutcome::NothingToAbort
        );
    }

    #[tokio::test]
    async fn test_register_supersedes_previous_session() {
        let registry = SessionRegistry::new();
        let conv = ConversationId::from("c1");
        let (first, mut first_rx) = registry.open(conv.clone());
        let (second, _second_rx) = registry.open(conv.clone());

        assert_eq!(
            first_rx.recv().await,
            Some(SessionControl::Close(CloseReason::Superseded))
        );
        assert_eq!(registry.count(), 1);

        // The superseded session cannot remove its replacement
        assert!(!registry.unregister(&conv, first));
        assert!(registry.unregister(&conv, second));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseReason::Completed.code(), 1000);
        assert_eq!(CloseReason::UserAbort.code(), 4000);
        assert_eq!(CloseReason::Superseded.code(), 4001);
        assert_eq!(CloseReason::Error.code(), 1011);
    }

    #[test]
    fn test_close_all_drains() {
        let registry = SessionRegistry::new();
        let (_a, _rx_a) = registry.open(ConversationId::from("a"));
        let (_b, _rx_b) = registry.open(ConversationId::from("b"));
        assert_eq!(registry.close_all(CloseReason::Error), 2);
        assert_eq!(registry.count(), 0);
    }
}

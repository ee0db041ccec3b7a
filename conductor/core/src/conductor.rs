//! Conductor - The Orchestration Core
//!
//! The [`Conductor`] is the long-lived context object shared by every
//! request. It owns the connection pool and router, the session registry,
//! the history assembler, the search augmenter and the stream orchestrator,
//! and exposes the few operations transports need:
//!
//! - authenticate a credential and check conversation ownership
//! - prepare a turn (history, personalization, search)
//! - run a turn into a chunk sink
//! - abort the live session of a conversation
//!
//! # Design Philosophy
//!
//! The Conductor is transport-agnostic. The HTTP and WebSocket handlers only
//! translate between wire frames and these operations, so the whole turn can
//! be driven from a test with a channel standing in for the socket.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::auth::{AuthError, Authenticator};
use crate::backend::{BackendError, LlmBackend, OllamaBackend};
use crate::config::{ConductorConfig, ConfigError};
use crate::history::HistoryAssembler;
use crate::messages::{Conversation, ConversationId, NewTurn, UserId};
use crate::routing::{
    BindingSnapshot, ConnectionPool, ModelRouter, PoolStats, ProgressSink, RouterError,
};
use crate::search::{SearchAugmenter, SearchDefaults, SearchError, SearchProvider, TavilyClient};
use crate::session_registry::{AbortOutcome, CloseReason, SessionRegistry};
use crate::store::{ChatStore, StoreError};
use crate::streaming::{
    PartialOutput, PreparedTurn, StreamChunk, StreamOrchestrator, TurnOutcome, TurnState,
};

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced to transports
#[derive(Debug, Error)]
pub enum ConductorError {
    /// Missing or invalid credential
    #[error("authentication failed: {0}")]
    Unauthorized(#[from] AuthError),

    /// The conversation does not exist or belongs to someone else
    #[error("conversation not found")]
    ConversationNotFound,

    /// The request is malformed
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No connection could be obtained for the model
    #[error(transparent)]
    Routing(#[from] RouterError),

    /// A backend client could not be created or called
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The search client could not be created
    #[error(transparent)]
    Search(#[from] SearchError),

    /// Persistence failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ============================================================================
// Requests
// ============================================================================

/// A chat turn as requested by a client
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TurnRequest {
    /// Model named by the client, if any
    pub model: Option<String>,
    /// The new user turn
    pub turn: NewTurn,
    /// Whether to augment with web search
    pub web_search: bool,
}

/// External collaborators of a [`Conductor`]
pub struct ConductorParts {
    /// Persistence
    pub store: Arc<dyn ChatStore>,
    /// Credential verification
    pub auth: Arc<dyn Authenticator>,
    /// One backend handle per pool connection
    pub backends: Vec<Arc<dyn LlmBackend>>,
    /// Web search provider
    pub search_provider: Arc<dyn SearchProvider>,
}

// ============================================================================
// Conductor
// ============================================================================

/// Shared orchestration context
pub struct Conductor {
    default_model: String,
    store: Arc<dyn ChatStore>,
    auth: Arc<dyn Authenticator>,
    router: Arc<ModelRouter>,
    history: HistoryAssembler,
    search: SearchAugmenter,
    orchestrator: StreamOrchestrator,
    sessions: SessionRegistry,
}

impl Conductor {
    /// Build a conductor from explicit parts
    #[must_use]
    pub fn new(config: &ConductorConfig, parts: ConductorParts) -> Self {
        let pool = Arc::new(ConnectionPool::new(parts.backends));
        let router = Arc::new(ModelRouter::new(pool, config.backend.eviction));
        let history = HistoryAssembler::new(
            Arc::clone(&parts.store),
            config.history.max_turns,
            config.history.max_document_chars,
        );
        let search = SearchAugmenter::new(
            parts.search_provider,
            Arc::clone(&parts.store),
            config.search.api_key.clone(),
            config.search.env_api_key.clone(),
            SearchDefaults {
                max_results: config.search.max_results,
                search_depth: config.search.search_depth.clone(),
            },
        );
        let orchestrator = StreamOrchestrator::new(Arc::clone(&router), Arc::clone(&parts.store));

        tracing::info!(
            pool_size = router.pool().size(),
            eviction = %config.backend.eviction,
            default_model = %config.backend.default_model,
            "Conductor initialized"
        );

        Self {
            default_model: config.backend.default_model.clone(),
            store: parts.store,
            auth: parts.auth,
            router,
            history,
            search,
            orchestrator,
            sessions: SessionRegistry::new(),
        }
    }

    /// Build a conductor talking to Ollama and Tavily as configured
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or an HTTP client
    /// cannot be created.
    pub fn from_config(
        config: &ConductorConfig,
        store: Arc<dyn ChatStore>,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Self, ConductorError> {
        config.validate()?;

        let size = config.backend.effective_pool_size();
        let mut backends: Vec<Arc<dyn LlmBackend>> = Vec::with_capacity(size);
        for _ in 0..size {
            backends.push(Arc::new(OllamaBackend::new(
                config.backend.base_url.clone(),
                config.backend.connect_timeout,
                config.backend.read_timeout,
            )?));
        }
        let search_provider = Arc::new(TavilyClient::new(
            config.search.base_url.clone(),
            config.search.timeout,
        )?);

        Ok(Self::new(
            config,
            ConductorParts {
                store,
                auth,
                backends,
                search_provider,
            },
        ))
    }

    /// Resolve a credential to a user
    ///
    /// # Errors
    ///
    /// Returns [`ConductorError::Unauthorized`] for a missing or unknown
    /// credential.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<UserId, ConductorError> {
        let credential = credential.ok_or(AuthError::MissingCredential)?;
        Ok(self.auth.authenticate(credential).await?)
    }

    /// Load a conversation, checking that `user` owns it
    ///
    /// # Errors
    ///
    /// Returns [`ConductorError::ConversationNotFound`] when it does not
    /// exist or is owned by someone else.
    pub async fn owned_conversation(
        &self,
        id: &ConversationId,
        user: &UserId,
    ) -> Result<Conversation, ConductorError> {
        match self.store.conversation(id).await? {
            Some(conversation) if &conversation.owner == user => Ok(conversation),
            Some(_) => {
                tracing::warn!(conversation_id = %id, user = %user, "Conversation owned by another user");
                Err(ConductorError::ConversationNotFound)
            }
            None => Err(ConductorError::ConversationNotFound),
        }
    }

    /// Model for a turn: the request's, else the conversation's, else the
    /// configured default
    #[must_use]
    pub fn resolve_model(&self, requested: Option<&str>, conversation: &Conversation) -> String {
        requested
            .filter(|m| !m.trim().is_empty())
            .or_else(|| conversation.model.as_deref().filter(|m| !m.trim().is_empty()))
            .unwrap_or(&self.default_model)
            .to_string()
    }

    /// Assemble history, persist the user turn and run web search
    ///
    /// # Errors
    ///
    /// Returns [`ConductorError::Store`] if history cannot be read or the
    /// user turn cannot be written.
    pub async fn prepare_turn(
        &self,
        user: &UserId,
        conversation: &Conversation,
        request: TurnRequest,
    ) -> Result<PreparedTurn, ConductorError> {
        let model = self.resolve_model(request.model.as_deref(), conversation);
        if conversation.model.as_deref() != Some(model.as_str()) {
            if let Err(e) = self.store.set_conversation_model(&conversation.id, &model).await {
                tracing::warn!(conversation_id = %conversation.id, error = %e, "Failed to record model");
            }
        }

        let preferences = match self.store.user_preferences(user).await {
            Ok(preferences) => preferences,
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "Failed to load preferences");
                crate::messages::UserPreferences::default()
            }
        };

        let query = request.turn.content.clone();
        let mut assembled = self
            .history
            .assemble(&conversation.id, request.turn, &preferences)
            .await?;

        if request.web_search {
            let augmentation = self.search.augment(&query, user).await;
            if augmentation.is_degraded() {
                tracing::info!(conversation_id = %conversation.id, "Web search degraded to notice");
            }
            assembled.push_system(augmentation.into_system_message());
        }

        Ok(PreparedTurn {
            conversation_id: conversation.id.clone(),
            model,
            messages: assembled.into_messages(),
        })
    }

    /// Prepare and stream a turn into `sink`
    ///
    /// Preparation failures are delivered as a terminal error chunk, like
    /// any other turn failure.
    pub async fn run_turn(
        &self,
        user: &UserId,
        conversation: &Conversation,
        request: TurnRequest,
        sink: mpsc::Sender<StreamChunk>,
        progress: Option<&dyn ProgressSink>,
        partial: PartialOutput,
    ) -> TurnOutcome {
        let model = self.resolve_model(request.model.as_deref(), conversation);
        match self.prepare_turn(user, conversation, request).await {
            Ok(prepared) => self.orchestrator.run(prepared, sink, progress, partial).await,
            Err(e) => {
                tracing::error!(conversation_id = %conversation.id, error = %e, "Failed to prepare turn");
                let error = e.to_string();
                let _ = sink.send(StreamChunk::error(&model, &error)).await;
                TurnOutcome {
                    state: TurnState::Failed,
                    content: String::new(),
                    error: Some(error),
                    persisted: false,
                    connection: None,
                }
            }
        }
    }

    /// Stop the live session of a conversation
    pub fn abort(&self, conversation_id: &ConversationId) -> AbortOutcome {
        self.sessions.abort(conversation_id)
    }

    /// Live session registry
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Persistence
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    /// Model router
    #[must_use]
    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    /// Pool statistics
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.router.pool().stats()
    }

    /// Model bindings per connection
    #[must_use]
    pub fn bindings(&self) -> Vec<BindingSnapshot> {
        self.router.pool().bindings()
    }

    /// Whether the inference backend answers a health probe
    pub async fn backend_reachable(&self) -> bool {
        self.router.pool().backend_reachable().await
    }

    /// Close live sessions and the connection pool
    pub fn shutdown(&self) {
        let closed = self.sessions.close_all(CloseReason::Error);
        self.router.pool().shutdown();
        tracing::info!(sessions = closed, "Conductor shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenAuthenticator;
    use crate::backend::ChatMessage;
    use crate::messages::{MessageRole, UserPreferences};
    use crate::search::{SearchQuery, SearchResult};
    use crate::store::MemoryStore;
    use crate::test_utils::ScriptedBackend;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct FailingSearch;

    #[async_trait]
    impl SearchProvider for FailingSearch {
        async fn search(
            &self,
            _api_key: &str,
            _query: &SearchQuery,
        ) -> Result<Vec<SearchResult>, SearchError> {
            Err(SearchError::Transport("timed out".into()))
        }
    }

    fn conductor(store: Arc<MemoryStore>, backend: Arc<ScriptedBackend>) -> Conductor {
        let mut auth = StaticTokenAuthenticator::new();
        auth.insert("tok", UserId::from("alice"));
        let mut config = ConductorConfig::default();
        config.search.api_key = Some("key".into());
        Conductor::new(
            &config,
            ConductorParts {
                store,
                auth: Arc::new(auth),
                backends: vec![backend],
                search_provider: Arc::new(FailingSearch),
            },
        )
    }

    #[tokio::test]
    async fn test_authenticate_and_ownership() {
        let store = Arc::new(MemoryStore::new());
        let conductor = conductor(store.clone(), Arc::new(ScriptedBackend::default()));
        let bob_conv = store
            .create_conversation(&UserId::from("bob"), "b", None)
            .await
            .unwrap();

        let alice = conductor.authenticate(Some("tok")).await.unwrap();
        assert_eq!(alice, UserId::from("alice"));
        assert!(matches!(
            conductor.authenticate(None).await,
            Err(ConductorError::Unauthorized(AuthError::MissingCredential))
        ));
        assert!(matches!(
            conductor.owned_conversation(&bob_conv.id, &alice).await,
            Err(ConductorError::ConversationNotFound)
        ));
    }

    #[tokio::test]
    async fn test_model_resolution_order() {
        let store = Arc::new(MemoryStore::new());
        let conductor = conductor(store.clone(), Arc::new(ScriptedBackend::default()));
        let mut conv = store
            .create_conversation(&UserId::from("alice"), "t", None)
            .await
            .unwrap();

        assert_eq!(conductor.resolve_model(None, &conv), "llama2");
        conv.model = Some("mistral".into());
        assert_eq!(conductor.resolve_model(None, &conv), "mistral");
        assert_eq!(conductor.resolve_model(Some("phi3"), &conv), "phi3");
        assert_eq!(conductor.resolve_model(Some(""), &conv), "mistral");
    }

    #[tokio::test]
    async fn test_search_failure_still_completes_with_notice() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(ScriptedBackend::default());
        let conductor = conductor(store.clone(), Arc::clone(&backend));
        let user = UserId::from("alice");
        store.set_preferences(
            &user,
            UserPreferences {
                use_personal_info: true,
                personal_info: Some("I write Rust.".into()),
                nickname: None,
            },
        );
        let conv = store.create_conversation(&user, "t", None).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let request = TurnRequest {
            model: None,
            turn: NewTurn::text("latest rust release?"),
            web_search: true,
        };
        let outcome = conductor
            .run_turn(&user, &conv, request, tx, None, PartialOutput::Discard)
            .await;
        while rx.recv().await.is_some() {}

        assert_eq!(outcome.state, TurnState::Completed);

        let sent = backend.last_request.lock().clone().unwrap();
        let roles: Vec<MessageRole> = sent.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![MessageRole::System, MessageRole::System, MessageRole::User]
        );
        assert!(sent.messages[1].content.contains("search failed"));
        assert_eq!(sent.messages[2], ChatMessage::user("latest rust release?"));

        let stored = store.messages(&conv.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].role, MessageRole::User);
        assert_eq!(stored[1].content, "Hello");
    }

    #[tokio::test]
    async fn test_user_turn_persisted_when_routing_fails() {
        let store = Arc::new(MemoryStore::new());
        let mut backend = ScriptedBackend::default();
        backend.fail_prime.insert("llama2".into());
        let conductor = conductor(store.clone(), Arc::new(backend));
        let user = UserId::from("alice");
        let conv = store.create_conversation(&user, "t", None).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let outcome = conductor
            .run_turn(
                &user,
                &conv,
                TurnRequest {
                    turn: NewTurn::text("hi"),
                    ..Default::default()
                },
                tx,
                None,
                PartialOutput::Persist,
            )
            .await;

        assert_eq!(outcome.state, TurnState::Failed);
        assert!(rx.recv().await.unwrap().is_error());
        let stored = store.messages(&conv.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "hi");
    }
}

//! HTTP Routes
//!
//! Every route except `/health` requires a bearer credential. Chat streams
//! newline-delimited JSON; the body stream owns the chunk receiver, so a
//! client disconnect drops it and the turn stops forwarding.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use super::frame::{ndjson_line, HttpChatRequest};
use super::websocket;
use crate::auth::bearer_token;
use crate::conductor::{Conductor, ConductorError};
use crate::messages::{ConversationId, UserId};
use crate::session_registry::AbortOutcome;
use crate::streaming::{PartialOutput, TurnState};

/// Chunks buffered between a turn and its HTTP body
const CHUNK_BUFFER: usize = 64;

/// Build the client-facing router
pub fn router(conductor: Arc<Conductor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/api/conversations/:id/messages", get(list_messages))
        .route("/api/conversations/:id/chat", post(chat))
        .route("/api/conversations/:id/abort", post(abort))
        .route("/api/conversations/:id/ws", get(websocket::upgrade))
        .with_state(conductor)
}

// ============================================================================
// Errors and extractors
// ============================================================================

impl ConductorError {
    /// HTTP status for this error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ConversationNotFound => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Routing(_) | Self::Backend(_) => StatusCode::BAD_GATEWAY,
            Self::Search(_) | Self::Store(_) | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ConductorError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// The authenticated caller
pub struct AuthUser(pub UserId);

#[axum::async_trait]
impl FromRequestParts<Arc<Conductor>> for AuthUser {
    type Rejection = ConductorError;

    async fn from_request_parts(
        parts: &mut Parts,
        conductor: &Arc<Conductor>,
    ) -> Result<Self, Self::Rejection> {
        let credential = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token);
        conductor.authenticate(credential).await.map(AuthUser)
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(conductor): State<Arc<Conductor>>) -> impl IntoResponse {
    let backend_reachable = conductor.backend_reachable().await;
    if !backend_reachable {
        tracing::warn!("Inference backend did not answer the health probe");
    }
    Json(json!({
        "status": "ok",
        "backend_reachable": backend_reachable,
        "pool": conductor.pool_stats(),
        "bindings": conductor.bindings(),
        "sessions": conductor.sessions().count(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct CreateConversation {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

async fn create_conversation(
    State(conductor): State<Arc<Conductor>>,
    AuthUser(user): AuthUser,
    Json(body): Json<CreateConversation>,
) -> Result<Response, ConductorError> {
    let title = body
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "New Conversation".to_string());
    let conversation = conductor
        .store()
        .create_conversation(&user, &title, body.model)
        .await?;
    tracing::info!(conversation_id = %conversation.id, user = %user, "Conversation created");
    Ok((StatusCode::CREATED, Json(conversation)).into_response())
}

async fn list_conversations(
    State(conductor): State<Arc<Conductor>>,
    AuthUser(user): AuthUser,
) -> Result<Response, ConductorError> {
    let conversations = conductor.store().list_conversations(&user).await?;
    Ok(Json(conversations).into_response())
}

async fn list_messages(
    State(conductor): State<Arc<Conductor>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Response, ConductorError> {
    let conversation = conductor
        .owned_conversation(&ConversationId::from(id), &user)
        .await?;
    let messages = conductor.store().messages(&conversation.id).await?;
    Ok(Json(messages).into_response())
}

async fn chat(
    State(conductor): State<Arc<Conductor>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(body): Json<HttpChatRequest>,
) -> Result<Response, ConductorError> {
    let conversation = conductor
        .owned_conversation(&ConversationId::from(id), &user)
        .await?;
    let stream = body.stream;
    let request = body.into_turn_request()?;
    let model = conductor.resolve_model(request.model.as_deref(), &conversation);
    let span = tracing::info_span!("chat", conversation_id = %conversation.id, model = %model);

    let (tx, mut rx) = mpsc::channel(CHUNK_BUFFER);

    if stream {
        let turn_conductor = Arc::clone(&conductor);
        tokio::spawn(
            async move {
                let outcome = turn_conductor
                    .run_turn(&user, &conversation, request, tx, None, PartialOutput::Discard)
                    .await;
                tracing::info!(state = ?outcome.state, chars = outcome.content.len(), "Turn finished");
            }
            .instrument(span),
        );

        let body = Body::from_stream(
            ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(ndjson_line(&chunk))),
        );
        return Ok(([(CONTENT_TYPE, "application/x-ndjson")], body).into_response());
    }

    let drain = async move { while rx.recv().await.is_some() {} };
    let turn = conductor
        .run_turn(&user, &conversation, request, tx, None, PartialOutput::Discard)
        .instrument(span);
    let (outcome, ()) = tokio::join!(turn, drain);

    match outcome.state {
        TurnState::Completed => Ok(Json(json!({
            "model": model,
            "message": { "role": "assistant", "content": outcome.content },
        }))
        .into_response()),
        _ => {
            let error = outcome
                .error
                .unwrap_or_else(|| "turn did not complete".to_string());
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": error })),
            )
                .into_response())
        }
    }
}

async fn abort(
    State(conductor): State<Arc<Conductor>>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Response, ConductorError> {
    let conversation = conductor
        .owned_conversation(&ConversationId::from(id), &user)
        .await?;
    let message = match conductor.abort(&conversation.id) {
        AbortOutcome::Aborted => "Stream aborted",
        AbortOutcome::NothingToAbort => "No active stream to abort",
    };
    Ok(Json(json!({ "status": "success", "message": message })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;
    use crate::routing::RouterError;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ConductorError::Unauthorized(AuthError::InvalidCredential).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ConductorError::ConversationNotFound.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ConductorError::InvalidRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ConductorError::Routing(RouterError::NoConnections).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}

//! Duplex Session Transport
//!
//! One WebSocket carries one chat turn for one conversation.
//!
//! ```text
//!   upgrade (?token=)      register        chat frame        turn
//!  ───────────────────► ─────────────► ─────────────────► ─────────┐
//!   auth + ownership     SessionRegistry  {type:"chat"}    run_turn │
//!                                                                   │
//!   close(code) ◄── unregister ◄── {done}/{error} ◄── chunks ◄──────┘
//! ```
//!
//! The session task selects over four sources: the registry's control
//! channel, model load progress, turn chunks and the socket itself. A close
//! instruction from the registry wins over everything else, which is how an
//! abort from another connection stops the stream.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::Instrument;

use super::frame::{ClientFrame, ServerFrame};
use crate::conductor::{Conductor, ConductorError, TurnRequest};
use crate::messages::{Conversation, ConversationId, UserId};
use crate::routing::ProgressSink;
use crate::session_registry::{CloseReason, SessionControl};
use crate::streaming::{PartialOutput, StreamChunk};

const CHUNK_BUFFER: usize = 64;
const PROGRESS_BUFFER: usize = 8;

/// Query parameters of the upgrade request
#[derive(Debug, Deserialize)]
pub struct SessionParams {
    /// Bearer credential
    #[serde(default)]
    pub token: Option<String>,
}

/// Authenticate, check ownership and upgrade
///
/// Failures are rejected before the upgrade, so no session is registered and
/// no backend work starts.
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(conductor): State<Arc<Conductor>>,
    Path(id): Path<String>,
    Query(params): Query<SessionParams>,
) -> Result<Response, ConductorError> {
    let user = conductor.authenticate(params.token.as_deref()).await?;
    let conversation = conductor
        .owned_conversation(&ConversationId::from(id), &user)
        .await?;

    let span = tracing::info_span!(
        "session",
        conversation_id = %conversation.id,
        user = %user
    );
    Ok(ws.on_upgrade(move |socket| {
        run_session(conductor, user, conversation, socket).instrument(span)
    }))
}

type Sender = futures::stream::SplitSink<WebSocket, Message>;

async fn send_frame(sender: &mut Sender, frame: &ServerFrame) -> bool {
    let text = match frame.to_text() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode frame");
            return true;
        }
    };
    sender.send(Message::Text(text)).await.is_ok()
}

async fn send_close(sender: &mut Sender, reason: CloseReason) {
    let frame = CloseFrame {
        code: reason.code(),
        reason: reason.description().into(),
    };
    if let Err(e) = sender.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Close frame not delivered");
    }
}

/// Wait for the client's chat frame.
///
/// `Ok(None)` means the client left first.
async fn next_chat_frame(
    receiver: &mut SplitStream<WebSocket>,
) -> Result<Option<TurnRequest>, ConductorError> {
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let frame: ClientFrame = serde_json::from_str(&text)
                    .map_err(|e| ConductorError::InvalidRequest(e.to_string()))?;
                return frame.into_turn_request().map(Some);
            }
            Ok(Message::Close(_)) | Err(_) => return Ok(None),
            Ok(_) => {}
        }
    }
    Ok(None)
}

async fn run_session(
    conductor: Arc<Conductor>,
    user: UserId,
    conversation: Conversation,
    socket: WebSocket,
) {
    let conversation_id = conversation.id.clone();
    let (session_id, mut control) = conductor.sessions().open(conversation_id.clone());
    let (mut sender, mut receiver) = socket.split();

    let first = tokio::select! {
        biased;
        Some(SessionControl::Close(reason)) = control.recv() => {
            send_close(&mut sender, reason).await;
            conductor.sessions().unregister(&conversation_id, session_id);
            return;
        }
        first = next_chat_frame(&mut receiver) => first,
    };

    let request = match first {
        Ok(Some(request)) => request,
        Ok(None) => {
            tracing::info!(session_id = %session_id, "Client left before sending a turn");
            conductor.sessions().unregister(&conversation_id, session_id);
            return;
        }
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Rejected chat frame");
            send_frame(&mut sender, &ServerFrame::Error { error: e.to_string() }).await;
            send_close(&mut sender, CloseReason::Error).await;
            conductor.sessions().unregister(&conversation_id, session_id);
            return;
        }
    };

    let (chunk_tx, mut chunk_rx) = mpsc::channel::<StreamChunk>(CHUNK_BUFFER);
    let (progress_tx, mut progress_rx) = mpsc::channel::<ServerFrame>(PROGRESS_BUFFER);

    let turn_conductor = Arc::clone(&conductor);
    let turn = tokio::spawn(
        async move {
            let progress: &dyn ProgressSink = &progress_tx;
            turn_conductor
                .run_turn(
                    &user,
                    &conversation,
                    request,
                    chunk_tx,
                    Some(progress),
                    PartialOutput::Persist,
                )
                .await
        }
        .in_current_span(),
    );

    let mut close = Some(CloseReason::Completed);
    loop {
        tokio::select! {
            biased;
            Some(SessionControl::Close(reason)) = control.recv() => {
                tracing::info!(session_id = %session_id, code = reason.code(), "Session closed by registry");
                close = Some(reason);
                break;
            }
            Some(frame) = progress_rx.recv() => {
                if !send_frame(&mut sender, &frame).await {
                    close = None;
                    break;
                }
            }
            chunk = chunk_rx.recv() => match chunk {
                Some(chunk) => {
                    let frame = ServerFrame::from(chunk);
                    if matches!(frame, ServerFrame::Error { .. }) {
                        close = Some(CloseReason::Error);
                    }
                    if !send_frame(&mut sender, &frame).await {
                        close = None;
                        break;
                    }
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    tracing::info!(session_id = %session_id, "Client disconnected");
                    close = None;
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    if let Some(reason) = close {
        send_close(&mut sender, reason).await;
    }

    // Dropping the consumer is what stops an in-flight turn
    drop(chunk_rx);
    drop(progress_rx);
    match turn.await {
        Ok(outcome) => tracing::info!(
            session_id = %session_id,
            state = ?outcome.state,
            persisted = outcome.persisted,
            "Turn finished"
        ),
        Err(e) => tracing::error!(session_id = %session_id, error = %e, "Turn task failed"),
    }

    conductor.sessions().unregister(&conversation_id, session_id);
}

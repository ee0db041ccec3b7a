//! Transport Layer for Chat Clients
//!
//! Client-facing surfaces over the [`Conductor`](crate::Conductor):
//! - single-shot streaming HTTP (newline-delimited JSON)
//! - duplex WebSocket sessions registered in the session registry
//! - the abort endpoint that closes a live session from outside
//!
//! # Design Philosophy
//!
//! Handlers only translate between wire frames and Conductor operations.
//! Routing, history, search and persistence all live below this layer, so
//! both transports produce the same turn.

pub mod frame;
pub mod http;
pub mod websocket;

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::conductor::Conductor;

pub use frame::{ClientFrame, HttpChatRequest, ServerFrame, WireMessage};
pub use http::{router, AuthUser};

/// Serve the router on `listener` until `shutdown` resolves
///
/// Live sessions are closed and the pool is shut down once `shutdown`
/// fires, so open WebSockets do not hold the server up.
///
/// # Errors
///
/// Returns the listener's I/O error.
pub async fn serve<F>(
    listener: TcpListener,
    conductor: Arc<Conductor>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(Arc::clone(&conductor));
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("Shutdown requested");
            conductor.shutdown();
        })
        .await
}

//! Model Router
//!
//! Maps a model name to a pool connection that has that model loaded,
//! loading it on demand.
//!
//! # Algorithm
//!
//! 1. Fast path: a ready binding for the model is returned without locking.
//! 2. Otherwise take the model's load lock (one per model name, created on
//!    first use and kept for the life of the process) and check again.
//! 3. Still missing: reserve a free slot, or evict one per [`EvictionPolicy`].
//! 4. Prime the model with a tiny non-streaming chat while holding the
//!    connection's call lock, then mark the binding ready. On failure the
//!    binding is rolled back and the slot becomes free.
//!
//! Loads of different models never wait on each other's load lock. Concurrent
//! requests for the same model serialize behind one lock, so the model is
//! primed once and every caller gets the same connection.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use super::connection_pool::{Connection, ConnectionGuard, ConnectionPool, PoolError};
use super::policy::EvictionPolicy;
use crate::backend::{BackendError, ChatRequest};

// ============================================================================
// Errors
// ============================================================================

/// Errors from routing a request to a connection
#[derive(Debug, Error)]
pub enum RouterError {
    /// Model name was empty
    #[error("model name must not be empty")]
    EmptyModel,

    /// The pool has no connections
    #[error("connection pool has no connections")]
    NoConnections,

    /// The pool was shut down
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Priming the model failed; the binding was rolled back
    #[error("failed to load model '{model}' on connection {index}: {source}")]
    LoadFailed {
        /// Requested model
        model: String,
        /// Connection the load was attempted on
        index: usize,
        /// Backend failure
        #[source]
        source: BackendError,
    },
}

// ============================================================================
// Load progress
// ============================================================================

/// Phase of a model load as reported to the client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    /// Routing started
    Loading,
    /// A ready connection was obtained
    Ready,
    /// Routing failed
    Error,
}

/// Progress notification emitted while routing
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModelLoadEvent {
    /// Phase
    pub status: LoadStatus,
    /// Human-readable description
    pub message: String,
    /// 0 while loading, 100 once ready
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    /// Model being routed
    pub model: String,
}

impl ModelLoadEvent {
    fn loading(model: &str) -> Self {
        Self {
            status: LoadStatus::Loading,
            message: format!("Loading model {model}..."),
            progress: Some(0),
            model: model.to_string(),
        }
    }

    fn ready(model: &str) -> Self {
        Self {
            status: LoadStatus::Ready,
            message: format!("Model {model} ready"),
            progress: Some(100),
            model: model.to_string(),
        }
    }

    fn error(model: &str, err: &RouterError) -> Self {
        Self {
            status: LoadStatus::Error,
            message: format!("Error loading model: {err}"),
            progress: None,
            model: model.to_string(),
        }
    }
}

/// Receives model load progress. Delivery is best effort and never blocks
/// routing.
pub trait ProgressSink: Send + Sync {
    /// Deliver one event
    fn report(&self, event: ModelLoadEvent);
}

impl<T> ProgressSink for tokio::sync::mpsc::Sender<T>
where
    T: From<ModelLoadEvent> + Send,
{
    fn report(&self, event: ModelLoadEvent) {
        if let Err(e) = self.try_send(T::from(event)) {
            tracing::debug!(error = %e, "Dropped model load progress event");
        }
    }
}

// ============================================================================
// Routed connection
// ============================================================================

/// A connection with the requested model loaded
#[derive(Clone, Debug)]
pub struct RoutedConnection {
    model: String,
    connection: Arc<Connection>,
}

impl RoutedConnection {
    /// Model this connection was routed for
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Connection index
    #[must_use]
    pub fn index(&self) -> usize {
        self.connection.index()
    }

    /// Wait for exclusive use of the connection.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] once the pool has been shut down.
    pub async fn acquire(&self) -> Result<ConnectionGuard, PoolError> {
        self.connection.acquire().await
    }
}

// ============================================================================
// Model Router
// ============================================================================

/// Lazily loads models onto pool connections
pub struct ModelRouter {
    pool: Arc<ConnectionPool>,
    load_locks: DashMap<String, Arc<Mutex<()>>>,
    policy: EvictionPolicy,
    eviction_cursor: AtomicUsize,
}

impl ModelRouter {
    /// Create a router over `pool`
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>, policy: EvictionPolicy) -> Self {
        tracing::info!(size = pool.size(), policy = %policy, "Model router created");
        Self {
            pool,
            load_locks: DashMap::new(),
            policy,
            eviction_cursor: AtomicUsize::new(0),
        }
    }

    /// Underlying pool
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }


    /// Obtain a connection with `model` loaded, loading it if necessary.
    ///
    /// When `progress` is given it receives a loading event before routing
    /// and a ready or error event after.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::LoadFailed`] if priming fails, in which case the
    /// reserved binding has been rolled back.
    pub async fn acquire(
        &self,
        model: &str,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<RoutedConnection, RouterError> {
        if let Some(sink) = progress {
            sink.report(ModelLoadEvent::loading(model));
        }

        let result = self.route(model).await;

        if let Some(sink) = progress {
            match &result {
                Ok(_) => sink.report(ModelLoadEvent::ready(model)),
                Err(e) => sink.report(ModelLoadEvent::error(model, e)),
            }
        }
        result
    }

    async fn route(&self, model: &str) -> Result<RoutedConnection, RouterError> {
        if model.is_empty() {
            return Err(RouterError::EmptyModel);
        }
        if self.pool.size() == 0 {
            return Err(RouterError::NoConnections);
        }

        if let Some(index) = self.pool.ready_connection(model) {
            self.pool.stats.record_fast_path();
            return self.routed(model, index);
        }

        let lock = self.load_lock(model);
        let _load_guard = lock.lock().await;

        // Another caller may have finished loading while we waited
        if let Some(index) = self.pool.ready_connection(model) {
            self.pool.stats.record_fast_path();
            return self.routed(model, index);
        }

        let size = self.pool.size();
        let reservation = self.pool.reserve(model, || {
            self.policy.select(size, &self.eviction_cursor)
        });
        let index = reservation.index;
        self.pool.stats.record_load_started();

        tracing::info!(
            model,
            index,
            evicted = reservation.evicted.as_deref().unwrap_or(""),
            "Loading model"
        );

        match self.prime(model, index).await {
            Ok(()) => {
                if !self.pool.mark_ready(index, reservation.generation) {
                    // The slot was re-bound while priming; the model is still
                    // loaded in the backend, so the caller can use it.
                    tracing::warn!(model, index, "Binding superseded during load");
                }
                tracing::info!(model, index, "Model loaded");
                self.routed(model, index)
            }
            Err(source) => {
                self.pool.release(index, reservation.generation);
                self.pool.stats.record_load_failed();
                let err = match source {
                    PrimeError::Pool(e) => RouterError::Pool(e),
                    PrimeError::Backend(source) => RouterError::LoadFailed {
                        model: model.to_string(),
                        index,
                        source,
                    },
                };
                tracing::error!(model, index, error = %err, "Model load failed");
                Err(err)
            }
        }
    }

    async fn prime(&self, model: &str, index: usize) -> Result<(), PrimeError> {
        let connection = self
            .pool
            .connection(index)
            .ok_or(PrimeError::Pool(PoolError::Closed))?;
        let guard = connection.acquire().await.map_err(PrimeError::Pool)?;
        guard
            .backend()
            .chat(&ChatRequest::priming(model))
            .await
            .map_err(PrimeError::Backend)?;
        Ok(())
    }

    fn load_lock(&self, model: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.load_locks
                .entry(model.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn routed(&self, model: &str, index: usize) -> Result<RoutedConnection, RouterError> {
        let connection = self.pool.connection(index).ok_or(RouterError::NoConnections)?;
        Ok(RoutedConnection {
            model: model.to_string(),
            connection,
        })
    }
}

enum PrimeError {
    Pool(PoolError),
    Backend(BackendError),
}

//! Connection Pool Management
//!
//! A fixed set of backend connections plus the model binding table.
//!
//! # Design
//!
//! Each connection carries a one-permit semaphore: at most one backend call
//! (priming or streaming) runs on a connection at a time. The binding table
//! maps model to connection and connection to model; both directions are
//! updated together under one lock so they never disagree. A binding starts
//! out not ready while its model is being primed and only becomes visible to
//! the router's fast path once [`ConnectionPool::mark_ready`] succeeds.
//!
//! Every binding gets a generation number. Rollback and readiness updates
//! name the generation they belong to, so a loader whose slot was re-bound in
//! the meantime cannot clobber the newer binding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::backend::LlmBackend;

// ============================================================================
// Errors and statistics
// ============================================================================

/// Errors from acquiring a connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool has been shut down
    #[error("connection pool is shut down")]
    Closed,
}

/// Snapshot of pool statistics
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Number of connections
    pub size: usize,
    /// Requests served from an already-ready binding
    pub fast_path_hits: u64,
    /// Model loads started
    pub loads_started: u64,
    /// Model loads that failed and were rolled back
    pub loads_failed: u64,
    /// Bindings displaced to make room for another model
    pub evictions: u64,
}

#[derive(Debug, Default)]
pub(crate) struct PoolStatsAtomic {
    fast_path_hits: AtomicU64,
    loads_started: AtomicU64,
    loads_failed: AtomicU64,
    evictions: AtomicU64,
}

impl PoolStatsAtomic {
    pub(crate) fn record_fast_path(&self) {
        self.fast_path_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load_started(&self) {
        self.loads_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load_failed(&self) {
        self.loads_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Connections
// ============================================================================

/// One backend connection with its per-call lock
pub struct Connection {
    index: usize,
    backend: Arc<dyn LlmBackend>,
    call_lock: Arc<Semaphore>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("index", &self.index)
            .field("backend", &self.backend.name())
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl Connection {
    fn new(index: usize, backend: Arc<dyn LlmBackend>) -> Self {
        Self {
            index,
            backend,
            call_lock: Arc::new(Semaphore::new(1)),
        }
    }

    /// Position of this connection in the pool
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether a backend call currently holds this connection
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.call_lock.available_permits() == 0
    }

    /// Wait for exclusive use of this connection.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] once the pool has been shut down.
    pub async fn acquire(&self) -> Result<ConnectionGuard, PoolError> {
        let permit = Arc::clone(&self.call_lock)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        Ok(ConnectionGuard {
            index: self.index,
            backend: Arc::clone(&self.backend),
            _permit: permit,
        })
    }

    fn close(&self) {
        self.call_lock.close();
    }
}

/// Exclusive use of a connection; released on drop
pub struct ConnectionGuard {
    index: usize,
    backend: Arc<dyn LlmBackend>,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionGuard {
    /// Backend to call while the guard is held
    #[must_use]
    pub fn backend(&self) -> &dyn LlmBackend {
        self.backend.as_ref()
    }

    /// Connection index
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

// ============================================================================
// Binding table
// ============================================================================

#[derive(Clone, Debug)]
struct SlotBinding {
    model: String,
    ready: bool,
    generation: u64,
}

/// Public view of one slot's binding
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BindingSnapshot {
    /// Connection index
    pub index: usize,
    /// Bound model, if any
    pub model: Option<String>,
    /// Whether the bound model finished priming
    pub ready: bool,
    /// Whether a call currently holds the connection
    pub busy: bool,
}

/// Result of reserving a slot for a model load
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    /// Slot now bound (not ready) to the requested model
    pub index: usize,
    /// Generation of the new binding
    pub generation: u64,
    /// Model that previously held the slot, if it was evicted
    pub evicted: Option<String>,
}

#[derive(Debug)]
struct Bindings {
    model_to_connection: HashMap<String, usize>,
    connection_to_model: Vec<Option<SlotBinding>>,
}

impl Bindings {
    fn new(size: usize) -> Self {
        Self {
            model_to_connection: HashMap::new(),
            connection_to_model: vec![None; size],
        }
    }

    fn ready_index(&self, model: &str) -> Option<usize> {
        let index = *self.model_to_connection.get(model)?;
        match &self.connection_to_model[index] {
            Some(binding) if binding.ready => Some(index),
            _ => None,
        }
    }

    fn free_index(&self) -> Option<usize> {
        self.connection_to_model.iter().position(Option::is_none)
    }

    fn unbind(&mut self, index: usize) -> Option<SlotBinding> {
        let old = self.connection_to_model[index].take()?;
        self.model_to_connection.remove(&old.model);
        Some(old)
    }

    fn bind(&mut self, index: usize, model: &str, generation: u64) -> Option<String> {
        if let Some(stale) = self.model_to_connection.get(model).copied() {
            self.unbind(stale);
        }
        let evicted = self.unbind(index).map(|old| old.model);
        self.model_to_connection.insert(model.to_string(), index);
        self.connection_to_model[index] = Some(SlotBinding {
            model: model.to_string(),
            ready: false,
            generation,
        });
        evicted
    }

    fn current(&mut self, index: usize, generation: u64) -> Option<&mut SlotBinding> {
        self.connection_to_model
            .get_mut(index)?
            .as_mut()
            .filter(|b| b.generation == generation)
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// Fixed-size pool of backend connections with model bindings
pub struct ConnectionPool {
    connections: Vec<Arc<Connection>>,
    bindings: RwLock<Bindings>,
    next_generation: AtomicU64,
    pub(crate) stats: PoolStatsAtomic,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.connections.len())
            .field("bindings", &self.bindings())
            .finish()
    }
}

impl ConnectionPool {
    /// Build a pool with one connection per backend handle
    #[must_use]
    pub fn new(backends: Vec<Arc<dyn LlmBackend>>) -> Self {
        let size = backends.len();
        let connections = backends
            .into_iter()
            .enumerate()
            .map(|(index, backend)| Arc::new(Connection::new(index, backend)))
            .collect();

        tracing::info!(size, "Connection pool created");

        Self {
            connections,
            bindings: RwLock::new(Bindings::new(size)),
            next_generation: AtomicU64::new(1),
            stats: PoolStatsAtomic::default(),
        }
    }

    /// Number of connections
    #[must_use]
    pub fn size(&self) -> usize {
        self.connections.len()
    }

    /// Connection at `index`
    #[must_use]
    pub fn connection(&self, index: usize) -> Option<Arc<Connection>> {
        self.connections.get(index).cloned()
    }

    /// Index of the connection holding `model` in a ready state
    #[must_use]
    pub fn ready_connection(&self, model: &str) -> Option<usize> {
        self.bindings.read().ready_index(model)
    }

    /// Bind `model` to a slot, not ready.
    ///
    /// Uses the first free slot if there is one; otherwise asks `select_victim`
    /// for a slot and evicts its model. Selection and binding happen under a
    /// single write lock, so two concurrent loads of different models never
    /// receive the same free slot.
    pub fn reserve(&self, model: &str, select_victim: impl FnOnce() -> usize) -> Reservation {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut bindings = self.bindings.write();

        let index = bindings.free_index().unwrap_or_else(select_victim);
        let evicted = bindings.bind(index, model, generation);
        drop(bindings);

        if let Some(ref old) = evicted {
            self.stats.record_eviction();
            tracing::info!(index, evicted = %old, model, "Evicting model from connection");
        } else {
            tracing::debug!(index, model, "Reserved free connection");
        }

        Reservation {
            index,
            generation,
            evicted,
        }
    }

    /// Mark a reserved binding ready.
    ///
    /// Returns false when the slot was re-bound since the reservation.
    pub fn mark_ready(&self, index: usize, generation: u64) -> bool {
        match self.bindings.write().current(index, generation) {
            Some(binding) => {
                binding.ready = true;
                true
            }
            None => false,
        }
    }

    /// Roll back a reserved binding, freeing the slot.
    ///
    /// Returns false when the slot was re-bound since the reservation.
    pub fn release(&self, index: usize, generation: u64) -> bool {
        let mut bindings = self.bindings.write();
        if bindings.current(index, generation).is_none() {
            return false;
        }
        bindings.unbind(index);
        true
    }

    /// Snapshot of every slot
    #[must_use]
    pub fn bindings(&self) -> Vec<BindingSnapshot> {
        let bindings = self.bindings.read();
        bindings
            .connection_to_model
            .iter()
            .enumerate()
            .map(|(index, slot)| BindingSnapshot {
                index,
                model: slot.as_ref().map(|b| b.model.clone()),
                ready: slot.as_ref().is_some_and(|b| b.ready),
                busy: self.connections[index].is_busy(),
            })
            .collect()
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.connections.len(),
            fast_path_hits: self.stats.fast_path_hits.load(Ordering::Relaxed),
            loads_started: self.stats.loads_started.load(Ordering::Relaxed),
            loads_failed: self.stats.loads_failed.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    /// Probe the backend behind the pool.
    ///
    /// Every connection talks to the same backend, so the first one answers
    /// for all of them. An empty pool is never reachable.
    pub async fn backend_reachable(&self) -> bool {
        match self.connections.first() {
            Some(connection) => connection.backend.health_check().await,
            None => false,
        }
    }

    /// Close every connection; pending and future acquisitions fail
    pub fn shutdown(&self) {
        for connection in &self.connections {
            connection.close();
        }
        tracing::info!(size = self.connections.len(), "Connection pool shut down");
    }
}

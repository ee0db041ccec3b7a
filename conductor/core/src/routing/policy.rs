//! Eviction Policy
//!
//! Decides which connection gives up its model when every connection is bound
//! and a request arrives for a model that is not loaded anywhere.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Victim selection strategy for a saturated pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Always evict connection 0.
    ///
    /// Matches the historical behavior of the chat backend. Under contention
    /// between more distinct models than connections, slot 0 thrashes while
    /// the other slots keep their models.
    #[default]
    FirstSlot,
    /// Cycle through connections so every slot takes its turn being evicted
    RoundRobin,
}

impl EvictionPolicy {
    /// Pick the connection index to evict.
    ///
    /// `cursor` is owned by the router and only advanced by round robin.
    /// `pool_size` must be non-zero.
    pub fn select(self, pool_size: usize, cursor: &AtomicUsize) -> usize {
        match self {
            Self::FirstSlot => 0,
            Self::RoundRobin => cursor.fetch_add(1, Ordering::Relaxed) % pool_size,
        }
    }
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FirstSlot => write!(f, "first_slot"),
            Self::RoundRobin => write!(f, "round_robin"),
        }
    }
}

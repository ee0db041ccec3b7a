//! Connection Pool and Model Router
//!
//! Sharing a small number of backend connections between many models.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |   ModelRouter    |  <-- acquire(model): fast path, load lock, prime
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |  EvictionPolicy  |  <-- which slot to give up when all are bound
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |  ConnectionPool  |  <-- N connections, binding table, per-call locks
//! +--------+---------+
//!          |
//!    +-----+-----+
//!    |     |     |
//!    v     v     v
//! +----+ +----+ +----+
//! | #0 | | #1 | | #N |  <-- one backend client each
//! +----+ +----+ +----+
//! ```

pub mod connection_pool;
pub mod policy;
pub mod router;

pub use connection_pool::{
    BindingSnapshot, Connection, ConnectionGuard, ConnectionPool, PoolError, PoolStats,
    Reservation,
};
pub use policy::EvictionPolicy;
pub use router::{
    LoadStatus, ModelLoadEvent, ModelRouter, ProgressSink, RoutedConnection, RouterError,
};

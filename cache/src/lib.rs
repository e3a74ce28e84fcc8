//! A process-local LRU cache kept coherent across processes by fanning
//! invalidation events out over a message broker.
//!
//! Each instance owns a private in-memory store; deletes and resets are
//! broadcast so every sibling drops the same data at the same time.
//!
//! # Features
//! - **Local reads, global invalidation**: `get` never touches the network;
//!   `invalidate`/`clear` reach every connected instance.
//! - **Non-Clone Support**: Stores values in an `Arc<V>`, avoiding `V: Clone` bounds.
//! - **Load coalescing**: `get_with` runs one loader per key per instance;
//!   concurrent callers share the result.
//! - **Self-healing**: Lost broker connections are rebuilt with exponential
//!   backoff, with listener hooks for both edges of the outage.
//! - **Pluggable edges**: The store and the broker are traits; a bundled
//!   LRU store and an in-process broker cover production and tests.
//! - **Observability**: Exposes detailed metrics for monitoring cache behavior.

// Public modules that form the API
pub mod builder;
pub mod error;
pub mod events;
pub mod handles;
pub mod metrics;
pub mod store;

// Internal, crate-only modules
mod loads;
mod protocol;
mod shared;
mod supervisor;

// Re-export the primary user-facing types for convenience
pub use builder::{CacheBuilder, ReconnectionOptions};
pub use error::{BoxError, CacheError};
pub use events::{
  InvalidationListener, ListenerId, ReconnectEvent, ReconnectedListener, ReconnectingListener,
};
pub use handles::Cache;
pub use metrics::MetricsSnapshot;
pub use store::{LocalStore, LruStore, StoreOptions};
pub use supervisor::ConnectionState;

// The broker seam, re-exported so applications need only one dependency.
pub use herd_broker::{Broker, BrokerError, MemoryBroker};

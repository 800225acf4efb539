//! # dynamo-lite
//!
//! A replicated, horizontally-scalable key-value store: consistent hash
//! ring partitioning, SWIM-style gossip membership, quorum replication,
//! and a causal (vector-clock) conflict model, backed by a
//! content-addressed write-ahead log.
//!
//! ## Architecture
//!
//! - [`ring`] — consistent hash ring with virtual nodes; decides which
//!   physical nodes own a key.
//! - [`storage`] — local KV store with an attached causal event log.
//! - [`gossip`] — SWIM-style peer table, probing, and rumor dissemination.
//! - [`health`] — per-peer liveness cache used to route around slow peers.
//! - [`replicator`] — quorum fan-out for writes/deletes across a key's
//!   preference list.
//! - [`coordinator`] — routes a request to the right preference list and
//!   delegates to the replicator.
//! - [`persistence`] — write-ahead log and content-addressed value store.
//! - [`network`] — wire protocol and TCP transport between nodes.
//! - [`node`] — composition root; owns the background gossip/probe/health
//!   loops.
//!
//! ## Thread safety
//!
//! Every shared structure here (`HashRing`, `CausalStore`, `Membership`,
//! `HealthMonitor`) is internally synchronized and meant to be held behind
//! an `Arc` and cloned across tasks.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod gossip;
pub mod health;
pub mod network;
pub mod node;
pub mod persistence;
pub mod replicator;
pub mod ring;
pub mod storage;
pub mod types;

pub use config::NodeConfig;
pub use coordinator::Coordinator;
pub use error::{NodeError, NodeResult};
pub use gossip::Membership;
pub use health::HealthMonitor;
pub use node::Node;
pub use replicator::{ReplicationOutcome, Replicator};
pub use ring::HashRing;
pub use storage::CausalStore;
pub use types::{ClockOrdering, Event, EventKind, NodeId, PeerInfo, PeerStatus, StoredValue, VectorClock};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use dynamo_lite::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::NodeConfig;
    pub use crate::coordinator::Coordinator;
    pub use crate::error::{NodeError, NodeResult};
    pub use crate::node::Node;
    pub use crate::replicator::ReplicationOutcome;
    pub use crate::types::{Event, NodeId, PeerInfo, PeerStatus, StoredValue, VectorClock};
    pub use chrono::{DateTime, Utc};
    pub use serde_json::{json, Value as JsonValue};
}

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initialize the logging system.
///
/// The log level can be controlled via the `DYNAMO_LITE_LOG` environment
/// variable:
/// - `DYNAMO_LITE_LOG=error` - Only errors
/// - `DYNAMO_LITE_LOG=warn` - Errors and warnings
/// - `DYNAMO_LITE_LOG=info` - General information (default)
/// - `DYNAMO_LITE_LOG=debug` - Debug information
/// - `DYNAMO_LITE_LOG=trace` - Verbose tracing
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("DYNAMO_LITE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific level, ignoring the environment.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(level);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

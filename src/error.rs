/// Error types for dynamo-lite operations.
///
/// All fallible operations return `Result<T, NodeError>`, giving callers a
/// single well-typed error hierarchy to match against.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    /// Key not found in the store.
    #[error("key '{key}' not found")]
    KeyNotFound { key: String },

    /// Serialization error when converting data to/from JSON.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid data format or structure.
    #[error("invalid data: {reason}")]
    InvalidData { reason: String },

    /// Local storage I/O or corruption error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// A quorum write or read could not get enough alive nodes.
    #[error("quorum unavailable: have {have}, need {need}")]
    QuorumUnavailable { have: usize, need: usize },

    /// A peer RPC (gossip, probe, replication, health) failed.
    #[error("peer '{node_id}' unreachable: {reason}")]
    PeerUnreachable { node_id: String, reason: String },

    /// A gossip send failed; caller should mark the target suspected.
    #[error("gossip send to '{node_id}' failed: {reason}")]
    GossipSendFailed { node_id: String, reason: String },

    /// The local database is corrupted and recovery failed at open.
    #[error("corrupted local database: {reason}")]
    Corrupted { reason: String },
}

pub type NodeResult<T> = Result<T, NodeError>;

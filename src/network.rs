//! Wire protocol and TCP transport for node-to-node communication.
//!
//! Every message is a 4-byte big-endian length header followed by a
//! JSON-encoded [`Message`]. This carries gossip heartbeats/probes,
//! membership handshakes, and replication RPCs — everything the
//! membership and replication layers need, over one simple framing.
use crate::error::{NodeError, NodeResult};
use crate::types::{Event, NodeId, PeerInfo, Rumor, VectorClock};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Default port for cluster communication.
pub const DEFAULT_PORT: u16 = 7878;

/// Maximum message size (16 MB).
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// The write/delete discriminant carried by a replication request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationOp {
    Put,
    Delete,
}

/// An event log exchanged wholesale during gossip heartbeats, seed sync,
/// or attached to a replication request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogSnapshot {
    pub events: Vec<Event>,
    pub clock: VectorClock,
    pub known_peers: HashSet<NodeId>,
}

/// Protocol messages exchanged between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ── Handshake & discovery ──────────────────────────────────────────
    /// Initial introduction when joining a cluster.
    Join { node_id: NodeId, address: SocketAddr },
    /// Reply to `Join` carrying the responder's current peer table.
    JoinAck { node_id: NodeId, peers: Vec<PeerInfo> },
    /// Best-effort notification sent to each known-alive peer on shutdown.
    Leave { node_id: NodeId },

    // ── Gossip round ────────────────────────────────────────────────────
    /// A gossip heartbeat: the sender's peer table snapshot plus active
    /// rumors. Also increments the sender's own `heartbeat_seq`.
    Heartbeat {
        from: NodeId,
        heartbeat_seq: u64,
        incarnation: u64,
        peers: Vec<PeerInfo>,
        rumors: Vec<Rumor>,
    },

    // ── Probe round ─────────────────────────────────────────────────────
    /// Direct liveness probe.
    Probe { from: NodeId },
    /// Reply to a direct or indirect probe.
    ProbeResponse { from: NodeId, success: bool },
    /// Ask a helper peer to probe `target` on the sender's behalf.
    IndirectProbeRequest { from: NodeId, target: NodeId, target_address: SocketAddr },
    /// A helper's result for an indirect probe, returned to the requester.
    IndirectProbeResponse { from: NodeId, target: NodeId, success: bool },

    // ── Health check (lightweight status RPC) ──────────────────────────
    Ping { from: NodeId },
    Pong { from: NodeId },

    // ── Replication ─────────────────────────────────────────────────────
    /// `POST /internal/replicate` equivalent.
    ReplicationRequest {
        key: String,
        value: Option<JsonValue>,
        operation: ReplicationOp,
        source_node: NodeId,
        source_event: Event,
        clock_snapshot: VectorClock,
        event_log_snapshot: Option<EventLogSnapshot>,
    },
    ReplicationResponse {
        success: bool,
        message: String,
        node_id: NodeId,
        error: Option<String>,
        updated_clock: Option<VectorClock>,
    },

    Error { message: String },
}

impl Message {
    pub fn to_bytes(&self) -> NodeResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(NodeError::SerializationError)
    }

    pub fn from_bytes(bytes: &[u8]) -> NodeResult<Self> {
        serde_json::from_slice(bytes).map_err(NodeError::SerializationError)
    }
}

/// A network connection to a peer.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }

    pub async fn connect(addr: SocketAddr) -> NodeResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NodeError::PeerUnreachable { node_id: addr.to_string(), reason: e.to_string() })?;
        Ok(Self::new(stream, addr))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send(&mut self, message: &Message) -> NodeResult<()> {
        let bytes = message.to_bytes()?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(NodeError::InvalidData {
                reason: format!("message too large: {} bytes (max {MAX_MESSAGE_SIZE})", bytes.len()),
            });
        }

        let len = bytes.len() as u32;
        self.stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| NodeError::StorageError(format!("write length header: {e}")))?;
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|e| NodeError::StorageError(format!("write message body: {e}")))?;
        self.stream
            .flush()
            .await
            .map_err(|e| NodeError::StorageError(format!("flush stream: {e}")))?;
        Ok(())
    }

    pub async fn receive(&mut self) -> NodeResult<Message> {
        let mut len_bytes = [0u8; 4];
        self.stream
            .read_exact(&mut len_bytes)
            .await
            .map_err(|e| NodeError::StorageError(format!("read length header: {e}")))?;

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(NodeError::InvalidData {
                reason: format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
            });
        }

        let mut bytes = vec![0u8; len];
        self.stream
            .read_exact(&mut bytes)
            .await
            .map_err(|e| NodeError::StorageError(format!("read message body: {e}")))?;
        Message::from_bytes(&bytes)
    }

    /// Send a message and wait for the peer's response.
    pub async fn request(&mut self, message: &Message) -> NodeResult<Message> {
        self.send(message).await?;
        self.receive().await
    }
}

/// TCP listener for incoming cluster connections.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> NodeResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NodeError::StorageError(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NodeError::StorageError(format!("local_addr: {e}")))?;
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> NodeResult<Connection> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| NodeError::StorageError(format!("accept: {e}")))?;
        Ok(Connection::new(stream, peer_addr))
    }
}

//! Core data types shared across the ring, storage, gossip, and replication
//! layers: node identity, vector clocks, events, and the gossip data model.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A stable string identifier for a node, chosen at launch.
pub type NodeId = String;

/// A `host:port` pair reachable over TCP for the RPC surface.
pub type Address = String;

/// Vector clock mapping node id to a monotonically increasing counter.
///
/// A missing entry is treated as 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    pub clocks: HashMap<NodeId, u64>,
}

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Equal,
    Before,
    After,
    Concurrent,
}

impl VectorClock {
    pub fn new() -> Self {
        Self {
            clocks: HashMap::new(),
        }
    }

    /// `clock[self] += 1`.
    pub fn tick(&mut self, node_id: &NodeId) {
        let entry = self.clocks.entry(node_id.clone()).or_insert(0);
        *entry += 1;
    }

    /// `clock[k] = max(clock[k], other[k])` for all k in either clock.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node_id, value) in &other.clocks {
            let entry = self.clocks.entry(node_id.clone()).or_insert(0);
            *entry = (*entry).max(*value);
        }
    }

    pub fn get(&self, node_id: &str) -> u64 {
        self.clocks.get(node_id).copied().unwrap_or(0)
    }

    /// A happens-before B iff for all k, A[k] <= B[k] and at least one
    /// k has A[k] < B[k].
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let all_nodes: std::collections::HashSet<&NodeId> =
            self.clocks.keys().chain(other.clocks.keys()).collect();

        let mut has_less = false;
        let mut has_greater = false;

        for node_id in all_nodes {
            let self_val = self.get(node_id);
            let other_val = other.get(node_id);
            match self_val.cmp(&other_val) {
                std::cmp::Ordering::Less => has_less = true,
                std::cmp::Ordering::Greater => has_greater = true,
                std::cmp::Ordering::Equal => {}
            }
        }

        match (has_less, has_greater) {
            (true, true) => ClockOrdering::Concurrent,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (false, false) => ClockOrdering::Equal,
        }
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }
}

/// The kind of operation an [`Event`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Put,
    Get,
    Delete,
}

/// An immutable record of a single storage operation.
///
/// `id` is `origin_node-nanotime-seq`. `causal_hash` dedups events across
/// peers during log merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub key: String,
    pub value: Option<JsonValue>,
    pub origin_node: NodeId,
    pub clock_snapshot: VectorClock,
    pub wall_time: DateTime<Utc>,
    pub causal_hash: String,
}

impl Event {
    pub fn new(
        id: String,
        kind: EventKind,
        key: String,
        value: Option<JsonValue>,
        origin_node: NodeId,
        clock_snapshot: VectorClock,
        wall_time: DateTime<Utc>,
    ) -> Self {
        let causal_hash = compute_causal_hash(kind, &key, value.as_ref(), &clock_snapshot);
        Self {
            id,
            kind,
            key,
            value,
            origin_node,
            clock_snapshot,
            wall_time,
            causal_hash,
        }
    }
}

/// Deterministic hash of `(kind, key, value, clock_snapshot)`.
pub fn compute_causal_hash(
    kind: EventKind,
    key: &str,
    value: Option<&JsonValue>,
    clock: &VectorClock,
) -> String {
    let mut clock_entries: Vec<(&NodeId, &u64)> = clock.clocks.iter().collect();
    clock_entries.sort_by(|a, b| a.0.cmp(b.0));

    let mut hasher = Sha256::new();
    hasher.update(format!("{kind:?}").as_bytes());
    hasher.update(key.as_bytes());
    if let Some(v) = value {
        hasher.update(v.to_string().as_bytes());
    }
    for (node_id, tick) in clock_entries {
        hasher.update(node_id.as_bytes());
        hasher.update(tick.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

/// The last-writer-wins projection of a key's current value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: JsonValue,
    pub wall_ts: DateTime<Utc>,
    pub version: String,
    pub metadata: StoredValueMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValueMetadata {
    pub origin_node: NodeId,
    pub event_id: String,
    pub clock_snapshot_string: String,
    pub replicated_flag: bool,
}

/// Membership status of a peer, per the SWIM-style state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Alive,
    Suspected,
    Dead,
}

/// A node's view of one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub address: Address,
    pub status: PeerStatus,
    pub last_seen_wall: DateTime<Utc>,
    pub heartbeat_seq: u64,
    pub incarnation: u64,
}

impl PeerInfo {
    pub fn new(node_id: NodeId, address: Address, incarnation: u64) -> Self {
        Self {
            node_id,
            address,
            status: PeerStatus::Alive,
            last_seen_wall: Utc::now(),
            heartbeat_seq: 0,
            incarnation,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen_wall = Utc::now();
    }
}

/// The kind of membership change a [`Rumor`] announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RumorKind {
    Join,
    Leave,
    Failure,
}

/// A membership event propagated epidemically with a bounded spread count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rumor {
    pub id: String,
    pub kind: RumorKind,
    pub payload: RumorPayload,
    pub origin: NodeId,
    pub wall_ts: DateTime<Utc>,
    pub spread_count: u32,
    pub max_spread: u32,
}

/// The peer a rumor concerns, plus the address needed to re-announce a join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RumorPayload {
    pub node_id: NodeId,
    pub address: Option<Address>,
}

impl Rumor {
    pub fn new(kind: RumorKind, payload: RumorPayload, origin: NodeId, max_spread: u32) -> Self {
        let id = format!(
            "{origin}-{kind:?}-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        Self {
            id,
            kind,
            payload,
            origin,
            wall_ts: Utc::now(),
            spread_count: 0,
            max_spread,
        }
    }

    pub fn is_expired(&self, ttl: chrono::Duration) -> bool {
        Utc::now() - self.wall_ts > ttl
    }

    pub fn is_exhausted(&self) -> bool {
        self.spread_count >= self.max_spread
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_increments_own_entry_only() {
        let mut clock = VectorClock::new();
        clock.tick(&"a".to_string());
        clock.tick(&"a".to_string());
        assert_eq!(clock.get("a"), 2);
        assert_eq!(clock.get("b"), 0);
    }

    #[test]
    fn merge_takes_componentwise_max() {
        let mut a = VectorClock::new();
        a.tick(&"a".to_string());
        a.tick(&"a".to_string());
        let mut b = VectorClock::new();
        b.tick(&"b".to_string());

        a.merge(&b);
        assert_eq!(a.get("a"), 2);
        assert_eq!(a.get("b"), 1);
    }

    #[test]
    fn compare_detects_before_after_concurrent_equal() {
        let mut a = VectorClock::new();
        a.tick(&"x".to_string());
        let b = a.clone();
        assert_eq!(a.compare(&b), ClockOrdering::Equal);

        let mut b2 = a.clone();
        b2.tick(&"x".to_string());
        assert_eq!(a.compare(&b2), ClockOrdering::Before);
        assert_eq!(b2.compare(&a), ClockOrdering::After);

        let mut c = VectorClock::new();
        c.tick(&"y".to_string());
        assert_eq!(a.compare(&c), ClockOrdering::Concurrent);
    }

    #[test]
    fn causal_hash_is_deterministic_and_content_sensitive() {
        let mut clock = VectorClock::new();
        clock.tick(&"a".to_string());
        clock.tick(&"b".to_string());

        let h1 = compute_causal_hash(EventKind::Put, "k", Some(&serde_json::json!(1)), &clock);
        let h2 = compute_causal_hash(EventKind::Put, "k", Some(&serde_json::json!(1)), &clock);
        assert_eq!(h1, h2);

        let h3 = compute_causal_hash(EventKind::Put, "k", Some(&serde_json::json!(2)), &clock);
        assert_ne!(h1, h3);
    }
}

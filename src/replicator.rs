//! Quorum replication: fan a write/read/delete out across a key's
//! preference list and require W/R acknowledgements before returning.
//!
//! The fan-out and per-peer timeout pattern is grounded on the teacher's
//! `ClusterNode::broadcast_write` (`cluster.rs`), generalized from a
//! best-effort all-peers broadcast into a bounded N/R/W quorum protocol.
use crate::error::{NodeError, NodeResult};
use crate::gossip::Membership;
use crate::health::HealthMonitor;
use crate::network::{Connection, EventLogSnapshot, Message, ReplicationOp};
use crate::persistence;
use crate::ring::HashRing;
use crate::storage::CausalStore;
use crate::types::{Event, NodeId, StoredValue, VectorClock};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Replication factor: number of nodes a key's value is kept on.
pub const N: usize = 3;
/// Read quorum: acknowledgements required for a quorum read.
pub const R: usize = 2;
/// Write quorum: acknowledgements required for a quorum write.
pub const W: usize = 2;
/// Per-peer RPC timeout for a replication request.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of a replicated write or delete.
#[derive(Debug, Clone)]
pub struct ReplicationOutcome {
    pub successful_nodes: Vec<NodeId>,
    pub failed_nodes: Vec<NodeId>,
    pub replication_level: usize,
    pub quorum_achieved: bool,
}

pub struct Replicator {
    node_id: NodeId,
    ring: Arc<HashRing>,
    storage: Arc<CausalStore>,
    membership: Arc<Membership>,
    health: Arc<HealthMonitor>,
    data_dir: PathBuf,
}

impl Replicator {
    pub fn new(
        node_id: NodeId,
        ring: Arc<HashRing>,
        storage: Arc<CausalStore>,
        membership: Arc<Membership>,
        health: Arc<HealthMonitor>,
        data_dir: PathBuf,
    ) -> Self {
        Self { node_id, ring, storage, membership, health, data_dir }
    }

    fn preference_list(&self, key: &str) -> Vec<NodeId> {
        self.ring.preference_list(key, N)
    }

    fn address_of(&self, node_id: &NodeId) -> Option<String> {
        self.membership.peer(node_id).map(|p| p.address)
    }

    /// Count of nodes this node currently considers alive, including
    /// itself (the local node is always alive).
    fn alive_count(&self) -> usize {
        let known = self.membership.peers_snapshot();
        1 + known.iter().filter(|p| self.health.is_alive(&p.node_id)).count()
    }

    /// Write `key = value`. Applies locally first if this node is in the
    /// preference list, then replicates to the remaining members,
    /// collecting W acknowledgements (including the local one) before
    /// reporting quorum achieved.
    pub async fn write(&self, key: &str, value: JsonValue) -> NodeResult<ReplicationOutcome> {
        let alive = self.alive_count();
        if alive < W {
            return Err(NodeError::QuorumUnavailable { have: alive, need: W });
        }

        let preflist = self.preference_list(key);
        if preflist.is_empty() {
            return Err(NodeError::QuorumUnavailable { have: 0, need: W });
        }

        let mut successful = Vec::new();
        let mut failed = Vec::new();

        let source_event = if preflist.contains(&self.node_id) {
            let event = self.storage.put(key, value.clone())?;
            successful.push(self.node_id.clone());
            event
        } else {
            // Not an owner: still produce a well-formed event to carry to
            // replicas, but don't touch the local clock or KV map.
            self.storage.put(key, value.clone())?
        };

        persistence::append_event(&self.data_dir, &source_event).await?;

        let targets: Vec<NodeId> = preflist.into_iter().filter(|n| n != &self.node_id).collect();
        let results = self
            .fan_out(&targets, key, Some(value), ReplicationOp::Put, &source_event)
            .await;

        for (node_id, ok) in results {
            if ok {
                successful.push(node_id);
            } else {
                failed.push(node_id);
            }
        }

        let replication_level = successful.len();
        Ok(ReplicationOutcome {
            quorum_achieved: replication_level >= W,
            successful_nodes: successful,
            failed_nodes: failed,
            replication_level,
        })
    }

    /// Delete `key`. Same fan-out shape as `write`.
    pub async fn delete(&self, key: &str) -> NodeResult<ReplicationOutcome> {
        let alive = self.alive_count();
        if alive < W {
            return Err(NodeError::QuorumUnavailable { have: alive, need: W });
        }

        let preflist = self.preference_list(key);
        if preflist.is_empty() {
            return Err(NodeError::QuorumUnavailable { have: 0, need: W });
        }

        let mut successful = Vec::new();
        let mut failed = Vec::new();

        let source_event = self.storage.delete(key)?;
        persistence::append_event(&self.data_dir, &source_event).await?;
        if preflist.contains(&self.node_id) {
            successful.push(self.node_id.clone());
        }

        let targets: Vec<NodeId> = preflist.into_iter().filter(|n| n != &self.node_id).collect();
        let results = self
            .fan_out(&targets, key, None, ReplicationOp::Delete, &source_event)
            .await;

        for (node_id, ok) in results {
            if ok {
                successful.push(node_id);
            } else {
                failed.push(node_id);
            }
        }

        let replication_level = successful.len();
        Ok(ReplicationOutcome {
            quorum_achieved: replication_level >= W,
            successful_nodes: successful,
            failed_nodes: failed,
            replication_level,
        })
    }

    /// Read `key` from local storage. As documented in the design notes,
    /// this is deliberately local-only — it does not perform R-of-N
    /// cross-node reconciliation.
    pub async fn read(&self, key: &str) -> NodeResult<Option<StoredValue>> {
        let alive = self.alive_count();
        if alive < R {
            return Err(NodeError::QuorumUnavailable { have: alive, need: R });
        }
        self.storage.get(key)
    }

    async fn fan_out(
        &self,
        targets: &[NodeId],
        key: &str,
        value: Option<JsonValue>,
        op: ReplicationOp,
        source_event: &Event,
    ) -> Vec<(NodeId, bool)> {
        let clock_snapshot = self.storage.current_clock();
        let event_log_snapshot = Some(EventLogSnapshot {
            events: self.storage.events_snapshot(),
            clock: clock_snapshot.clone(),
            known_peers: self.storage.known_peers_snapshot(),
        });

        let mut results = Vec::new();
        let mut handles = Vec::new();
        for target in targets {
            if !self.health.is_alive(target) {
                results.push((target.clone(), false));
                continue;
            }
            let Some(address) = self.address_of(target) else {
                results.push((target.clone(), false));
                continue;
            };
            let target = target.clone();
            let key = key.to_string();
            let value = value.clone();
            let source_event = source_event.clone();
            let node_id = self.node_id.clone();
            let clock_snapshot = clock_snapshot.clone();
            let event_log_snapshot = event_log_snapshot.clone();

            handles.push(tokio::spawn(async move {
                let outcome = replicate_to_peer(
                    &address,
                    &key,
                    value,
                    op,
                    &node_id,
                    source_event,
                    clock_snapshot,
                    event_log_snapshot,
                )
                .await;
                (target, outcome)
            }));
        }

        for handle in handles {
            if let Ok((node_id, ok)) = handle.await {
                results.push((node_id, ok));
            }
        }
        results
    }
}

#[allow(clippy::too_many_arguments)]
async fn replicate_to_peer(
    address: &str,
    key: &str,
    value: Option<JsonValue>,
    op: ReplicationOp,
    source_node: &NodeId,
    source_event: Event,
    clock_snapshot: VectorClock,
    event_log_snapshot: Option<EventLogSnapshot>,
) -> bool {
    let Ok(socket_addr) = address.parse() else { return false };
    let attempt = async {
        let mut conn = Connection::connect(socket_addr).await?;
        let response = conn
            .request(&Message::ReplicationRequest {
                key: key.to_string(),
                value,
                operation: op,
                source_node: source_node.clone(),
                source_event,
                clock_snapshot,
                event_log_snapshot,
            })
            .await?;
        match response {
            Message::ReplicationResponse { success, .. } => Ok::<bool, NodeError>(success),
            _ => Ok(false),
        }
    };

    matches!(tokio::time::timeout(RPC_TIMEOUT, attempt).await, Ok(Ok(true)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerInfo;
    use serde_json::json;
    use tempfile::TempDir;

    /// A lone node with no known peers: `alive_count() == 1`, below W and R.
    fn setup_single() -> (Arc<HashRing>, Arc<CausalStore>, Arc<Membership>, Arc<HealthMonitor>) {
        let ring = Arc::new(HashRing::new());
        ring.add(&"a".to_string());
        let storage = Arc::new(CausalStore::new("a".to_string()));
        let membership = Arc::new(Membership::new("a".to_string(), "127.0.0.1:1".to_string()));
        let health = Arc::new(HealthMonitor::new());
        (ring, storage, membership, health)
    }

    /// Self plus one known, health-alive peer: `alive_count() == 2`, meets
    /// both W and R. The peer's address is not actually reachable, so
    /// fan-out to it always fails; only the local half of quorum succeeds.
    fn setup_with_alive_peer() -> (Arc<HashRing>, Arc<CausalStore>, Arc<Membership>, Arc<HealthMonitor>) {
        let ring = Arc::new(HashRing::new());
        ring.add(&"a".to_string());
        ring.add(&"b".to_string());
        let storage = Arc::new(CausalStore::new("a".to_string()));
        let membership = Arc::new(Membership::new("a".to_string(), "127.0.0.1:1".to_string()));
        membership.merge_peer(PeerInfo::new("b".to_string(), "127.0.0.1:2".to_string(), 0));
        let health = Arc::new(HealthMonitor::new());
        health.record_success(&"b".to_string(), Duration::from_millis(1));
        (ring, storage, membership, health)
    }

    #[tokio::test]
    async fn write_fails_fast_without_local_commit_when_alive_count_below_w() {
        let (ring, storage, membership, health) = setup_single();
        let temp = TempDir::new().unwrap();
        let replicator =
            Replicator::new("a".to_string(), ring, storage.clone(), membership, health, temp.path().to_path_buf());
        let result = replicator.write("k", json!("v")).await;
        assert!(matches!(result, Err(NodeError::QuorumUnavailable { have: 1, need: 2 })));
        assert!(storage.get("k").unwrap().is_none());
    }

    #[tokio::test]
    async fn read_fails_fast_when_alive_count_below_r() {
        let (ring, storage, membership, health) = setup_single();
        let temp = TempDir::new().unwrap();
        let replicator = Replicator::new("a".to_string(), ring, storage, membership, health, temp.path().to_path_buf());
        let result = replicator.read("k").await;
        assert!(matches!(result, Err(NodeError::QuorumUnavailable { have: 1, need: 2 })));
    }

    #[tokio::test]
    async fn write_and_read_succeed_when_alive_count_meets_quorum() {
        let (ring, storage, membership, health) = setup_with_alive_peer();
        let temp = TempDir::new().unwrap();
        let replicator = Replicator::new("a".to_string(), ring, storage, membership, health, temp.path().to_path_buf());
        let outcome = replicator.write("k", json!("v")).await.unwrap();
        assert!(outcome.successful_nodes.contains(&"a".to_string()));

        let value = replicator.read("k").await.unwrap().unwrap();
        assert_eq!(value.value, json!("v"));
    }

    #[tokio::test]
    async fn write_persists_source_event_to_wal() {
        let (ring, storage, membership, health) = setup_with_alive_peer();
        let temp = TempDir::new().unwrap();
        let replicator = Replicator::new("a".to_string(), ring, storage, membership, health, temp.path().to_path_buf());
        replicator.write("k", json!("v")).await.unwrap();

        let reloaded = persistence::load_from_wal(temp.path(), "a".to_string()).await.unwrap();
        assert_eq!(reloaded.get("k").unwrap().unwrap().value, json!("v"));
    }

    #[tokio::test]
    async fn write_on_empty_ring_errors_with_quorum_unavailable() {
        let ring = Arc::new(HashRing::new());
        let storage = Arc::new(CausalStore::new("a".to_string()));
        let membership = Arc::new(Membership::new("a".to_string(), "127.0.0.1:1".to_string()));
        let health = Arc::new(HealthMonitor::new());
        let temp = TempDir::new().unwrap();
        let replicator = Replicator::new("a".to_string(), ring, storage, membership, health, temp.path().to_path_buf());
        let result = replicator.write("k", json!("v")).await;
        assert!(matches!(result, Err(NodeError::QuorumUnavailable { .. })));
    }
}

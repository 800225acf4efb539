//! Thin composition layer: resolves the owner and preference list for a
//! key (for observability) and delegates the actual work to the
//! [`Replicator`]. Any node can coordinate any key's request — ownership
//! only decides routing, never which node is allowed to serve it.
use crate::error::NodeResult;
use crate::replicator::{ReplicationOutcome, Replicator};
use crate::ring::HashRing;
use crate::types::{NodeId, StoredValue};
use serde_json::Value as JsonValue;
use std::sync::Arc;

pub struct Coordinator {
    ring: Arc<HashRing>,
    replicator: Arc<Replicator>,
}

impl Coordinator {
    pub fn new(ring: Arc<HashRing>, replicator: Arc<Replicator>) -> Self {
        Self { ring, replicator }
    }

    fn log_routing(&self, op: &str, key: &str) {
        let owner = self.ring.owner(key);
        let preflist = self.ring.preference_list(key, crate::replicator::N);
        tracing::debug!(op, key, ?owner, ?preflist, "coordinating request");
    }

    pub async fn put(&self, key: &str, value: JsonValue) -> NodeResult<ReplicationOutcome> {
        self.log_routing("put", key);
        self.replicator.write(key, value).await
    }

    pub async fn get(&self, key: &str) -> NodeResult<Option<StoredValue>> {
        self.log_routing("get", key);
        self.replicator.read(key).await
    }

    pub async fn delete(&self, key: &str) -> NodeResult<ReplicationOutcome> {
        self.log_routing("delete", key);
        self.replicator.delete(key).await
    }

    pub fn owner(&self, key: &str) -> Option<NodeId> {
        self.ring.owner(key)
    }

    pub fn preference_list(&self, key: &str) -> Vec<NodeId> {
        self.ring.preference_list(key, crate::replicator::N)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::Membership;
    use crate::health::HealthMonitor;
    use crate::storage::CausalStore;
    use crate::types::PeerInfo;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn put_then_get_round_trips_through_the_coordinator() {
        let ring = Arc::new(HashRing::new());
        ring.add(&"a".to_string());
        ring.add(&"b".to_string());
        let storage = Arc::new(CausalStore::new("a".to_string()));
        let membership = Arc::new(Membership::new("a".to_string(), "127.0.0.1:1".to_string()));
        membership.merge_peer(PeerInfo::new("b".to_string(), "127.0.0.1:2".to_string(), 0));
        let health = Arc::new(HealthMonitor::new());
        health.record_success(&"b".to_string(), Duration::from_millis(1));
        let data_dir = tempfile::TempDir::new().unwrap().into_path();
        let replicator =
            Arc::new(Replicator::new("a".to_string(), ring.clone(), storage, membership, health, data_dir));
        let coordinator = Coordinator::new(ring, replicator);

        coordinator.put("k", json!("v")).await.unwrap();
        let value = coordinator.get("k").await.unwrap().unwrap();
        assert_eq!(value.value, json!("v"));
    }
}

//! Per-peer health cache, refreshed by a lightweight status RPC.
//!
//! Grounded on the teacher's `send_heartbeats`/`update_peer_status` flow
//! in `cluster.rs`, but split out into its own cache so the replicator can
//! route writes around a peer the gossip layer still calls "alive" but
//! whose RPCs have started timing out.
use crate::types::NodeId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

pub const HEALTH_REFRESH_INTERVAL: Duration = Duration::from_secs(3);
pub const HEALTH_PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub is_alive: bool,
    pub last_checked_wall: DateTime<Utc>,
    pub response_time: Duration,
    pub failure_count: u32,
}

impl HealthStatus {
    fn initial() -> Self {
        Self {
            is_alive: true,
            last_checked_wall: Utc::now(),
            response_time: Duration::ZERO,
            failure_count: 0,
        }
    }
}

/// Cache of per-peer liveness, used by the replicator to route around
/// unhealthy nodes without waiting out a full RPC timeout on every write.
pub struct HealthMonitor {
    statuses: RwLock<HashMap<NodeId, HealthStatus>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self { statuses: RwLock::new(HashMap::new()) }
    }

    pub fn record_success(&self, node_id: &NodeId, rtt: Duration) {
        let mut statuses = self.statuses.write().expect("health lock poisoned");
        let entry = statuses.entry(node_id.clone()).or_insert_with(HealthStatus::initial);
        entry.is_alive = true;
        entry.last_checked_wall = Utc::now();
        entry.response_time = rtt;
        entry.failure_count = 0;
    }

    pub fn record_failure(&self, node_id: &NodeId) {
        let mut statuses = self.statuses.write().expect("health lock poisoned");
        let entry = statuses.entry(node_id.clone()).or_insert_with(HealthStatus::initial);
        entry.failure_count += 1;
        entry.last_checked_wall = Utc::now();
        entry.is_alive = entry.failure_count < 3;
    }

    /// Unknown peers are assumed alive until proven otherwise.
    pub fn is_alive(&self, node_id: &NodeId) -> bool {
        self.statuses
            .read()
            .expect("health lock poisoned")
            .get(node_id)
            .map(|s| s.is_alive)
            .unwrap_or(true)
    }

    pub fn snapshot(&self) -> HashMap<NodeId, HealthStatus> {
        self.statuses.read().expect("health lock poisoned").clone()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_peer_is_assumed_alive() {
        let monitor = HealthMonitor::new();
        assert!(monitor.is_alive(&"ghost".to_string()));
    }

    #[test]
    fn three_consecutive_failures_marks_peer_unhealthy() {
        let monitor = HealthMonitor::new();
        let id = "a".to_string();
        monitor.record_failure(&id);
        monitor.record_failure(&id);
        assert!(monitor.is_alive(&id));
        monitor.record_failure(&id);
        assert!(!monitor.is_alive(&id));
    }

    #[test]
    fn success_resets_failure_count() {
        let monitor = HealthMonitor::new();
        let id = "a".to_string();
        monitor.record_failure(&id);
        monitor.record_failure(&id);
        monitor.record_success(&id, Duration::from_millis(5));
        monitor.record_failure(&id);
        monitor.record_failure(&id);
        assert!(monitor.is_alive(&id));
    }
}

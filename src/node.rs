//! Composition root: wires storage, ring, membership, health, and
//! replication together, and owns the background tasks that keep them
//! running.
//!
//! The task-spawning shape (one `tokio::spawn` per concern, each with its
//! own `shutdown_rx` subscribed to a shared `broadcast` channel, selected
//! against an `interval` ticker) is lifted directly from the teacher's
//! `ClusterNode::start` (`cluster.rs`).
use crate::config::NodeConfig;
use crate::coordinator::Coordinator;
use crate::error::{NodeError, NodeResult};
use crate::gossip::{
    Membership, FANOUT, GOSSIP_INTERVAL, INDIRECT_PROBE_HELPERS, PROBE_INTERVAL, PROBE_TIMEOUT,
    RUMOR_TTL, SUSPICION_TIMEOUT,
};
use crate::health::{HealthMonitor, HEALTH_PING_TIMEOUT, HEALTH_REFRESH_INTERVAL};
use crate::network::{Connection, Listener, Message, ReplicationOp};
use crate::persistence;
use crate::replicator::Replicator;
use crate::ring::HashRing;
use crate::storage::CausalStore;
use crate::types::{NodeId, PeerInfo, PeerStatus, RumorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;

/// A running (or not-yet-started) cluster node.
pub struct Node {
    node_id: NodeId,
    config: NodeConfig,
    ring: Arc<HashRing>,
    storage: Arc<CausalStore>,
    membership: Arc<Membership>,
    health: Arc<HealthMonitor>,
    coordinator: Arc<Coordinator>,
    heartbeat_seq: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<RwLock<bool>>,
    actual_addr: Arc<RwLock<Option<SocketAddr>>>,
}

impl Node {
    /// Build a node from `config`, replaying its WAL (if any) and
    /// acquiring the data directory lock.
    pub async fn new(config: NodeConfig) -> NodeResult<Self> {
        let lock_state = persistence::acquire_lock(&config.data_dir).await?;
        if lock_state == persistence::LockState::Unclean {
            tracing::warn!("previous shutdown was unclean; replaying wal from last fsync point");
        }

        let node_id = config.node_id.clone();
        let storage = Arc::new(persistence::load_from_wal(&config.data_dir, node_id.clone()).await?);

        let ring = Arc::new(HashRing::new());
        ring.add(&node_id);

        let membership = Arc::new(Membership::new(node_id.clone(), config.bind_addr()));
        membership.seed_incarnation(chrono::Utc::now().timestamp().max(0) as u64);
        let health = Arc::new(HealthMonitor::new());
        let replicator = Arc::new(Replicator::new(
            node_id.clone(),
            ring.clone(),
            storage.clone(),
            membership.clone(),
            health.clone(),
            config.data_dir.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(ring.clone(), replicator));

        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            node_id,
            config,
            ring,
            storage,
            membership,
            health,
            coordinator,
            heartbeat_seq: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
            running: Arc::new(RwLock::new(false)),
            actual_addr: Arc::new(RwLock::new(None)),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The address this node is actually bound to, once started. Differs
    /// from `config.bind_addr()` when the configured port is 0.
    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        *self.actual_addr.read().await
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    pub fn membership(&self) -> Arc<Membership> {
        self.membership.clone()
    }

    pub fn health(&self) -> Arc<HealthMonitor> {
        self.health.clone()
    }

    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.clone()
    }

    pub fn storage(&self) -> Arc<CausalStore> {
        self.storage.clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Bind the listener, join a seed if configured, and spawn the
    /// background loops: request acceptance, gossip, probe, rumor
    /// cleanup, self-maintenance, and health-check.
    pub async fn start(&self) -> NodeResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(NodeError::StorageError("node already running".into()));
            }
            *running = true;
        }

        let bind_addr = self
            .config
            .bind_addr()
            .parse()
            .map_err(|e| NodeError::InvalidData { reason: format!("invalid bind address: {e}") })?;
        let listener = Listener::bind(bind_addr).await?;
        *self.actual_addr.write().await = Some(listener.local_addr());

        if let Some(seed) = self.config.seed.clone() {
            self.join_cluster(&seed).await?;
        }

        self.spawn_accept_loop(listener);

        if !self.config.no_gossip {
            self.spawn_gossip_loop();
            self.spawn_probe_loop();
            self.spawn_rumor_cleanup_loop();
            self.spawn_self_maintenance_loop();
            self.spawn_health_check_loop();
        }

        Ok(())
    }

    pub async fn stop(&self) -> NodeResult<()> {
        {
            let mut running = self.running.write().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }

        self.membership.add_rumor(RumorKind::Leave, self.node_id.clone(), None);
        for peer in self.membership.alive_peers() {
            if let Ok(addr) = peer.address.parse() {
                if let Ok(mut conn) = Connection::connect(addr).await {
                    let _ = conn.send(&Message::Leave { node_id: self.node_id.clone() }).await;
                }
            }
        }

        let _ = self.shutdown_tx.send(());
        persistence::release_lock(&self.config.data_dir).await
    }

    async fn join_cluster(&self, seed_addr: &str) -> NodeResult<()> {
        let addr = seed_addr
            .parse()
            .map_err(|e| NodeError::InvalidData { reason: format!("invalid seed address: {e}") })?;
        let own_addr = match self.bound_addr().await {
            Some(addr) => addr,
            None => self
                .config
                .bind_addr()
                .parse()
                .map_err(|e| NodeError::InvalidData { reason: format!("invalid bind address: {e}") })?,
        };
        let mut conn = Connection::connect(addr).await?;
        let response = conn
            .request(&Message::Join { node_id: self.node_id.clone(), address: own_addr })
            .await?;

        match response {
            Message::JoinAck { node_id, peers } => {
                self.membership.note_peer(node_id, seed_addr.to_string());
                for peer in peers {
                    self.ring.add(&peer.node_id);
                    self.membership.merge_peer(peer);
                }
                for peer in self.membership.peers_snapshot() {
                    self.ring.add(&peer.node_id);
                }
                Ok(())
            }
            Message::Error { message } => Err(NodeError::PeerUnreachable { node_id: seed_addr.to_string(), reason: message }),
            _ => Err(NodeError::InvalidData { reason: "unexpected response to join".into() }),
        }
    }

    fn spawn_accept_loop(&self, listener: Listener) {
        let storage = self.storage.clone();
        let membership = self.membership.clone();
        let ring = self.ring.clone();
        let data_dir = self.config.data_dir.clone();
        let node_id = self.node_id.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        if let Ok(conn) = result {
                            let storage = storage.clone();
                            let membership = membership.clone();
                            let ring = ring.clone();
                            let data_dir = data_dir.clone();
                            let node_id = node_id.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(conn, storage, membership, ring, data_dir, node_id).await {
                                    tracing::debug!(error = %e, "connection handler exited with error");
                                }
                            });
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_gossip_loop(&self) {
        let membership = self.membership.clone();
        let heartbeat_seq = self.heartbeat_seq.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(GOSSIP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let seq = heartbeat_seq.fetch_add(1, Ordering::SeqCst) + 1;
                        let targets = membership.gossip_targets(FANOUT);
                        let peers = membership.peers_snapshot();
                        let rumors = membership.rumors_to_spread();
                        for target in targets {
                            let message = Message::Heartbeat {
                                from: membership.node_id().clone(),
                                heartbeat_seq: seq,
                                incarnation: membership.incarnation(),
                                peers: peers.clone(),
                                rumors: rumors.clone(),
                            };
                            tokio::spawn(async move {
                                if let Ok(addr) = target.address.parse() {
                                    if let Ok(mut conn) = Connection::connect(addr).await {
                                        let _ = conn.send(&message).await;
                                    }
                                }
                            });
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_probe_loop(&self) {
        let membership = self.membership.clone();
        let ring = self.ring.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(PROBE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_probe_round(&membership).await;
                        for overdue in membership.overdue_suspects() {
                            membership.mark_dead(&overdue);
                            ring.remove(&overdue);
                            membership.add_rumor(RumorKind::Failure, overdue, None);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_rumor_cleanup_loop(&self) {
        let membership = self.membership.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(RUMOR_TTL / 4);
            loop {
                tokio::select! {
                    _ = ticker.tick() => membership.prune_expired_rumors(),
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_self_maintenance_loop(&self) {
        let membership = self.membership.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(SUSPICION_TIMEOUT * 4);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        membership.prune_dead_peers(SUSPICION_TIMEOUT * 12);
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_health_check_loop(&self) {
        let membership = self.membership.clone();
        let health = self.health.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(HEALTH_REFRESH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for peer in membership.peers_snapshot() {
                            let health = health.clone();
                            tokio::spawn(async move {
                                let started = tokio::time::Instant::now();
                                let result = tokio::time::timeout(HEALTH_PING_TIMEOUT, ping(&peer)).await;
                                match result {
                                    Ok(Ok(())) => health.record_success(&peer.node_id, started.elapsed()),
                                    _ => health.record_failure(&peer.node_id),
                                }
                            });
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }
}

async fn ping(peer: &PeerInfo) -> NodeResult<()> {
    let addr = peer
        .address
        .parse()
        .map_err(|e| NodeError::InvalidData { reason: format!("invalid peer address: {e}") })?;
    let mut conn = Connection::connect(addr).await?;
    match conn.request(&Message::Ping { from: peer.node_id.clone() }).await? {
        Message::Pong { .. } => Ok(()),
        _ => Err(NodeError::PeerUnreachable { node_id: peer.node_id.clone(), reason: "unexpected ping response".into() }),
    }
}

async fn run_probe_round(membership: &Arc<Membership>) {
    let Some(target) = membership.probe_target() else { return };

    if direct_probe(&target).await {
        membership.mark_alive(&target.node_id);
        return;
    }

    let helpers = membership.indirect_helpers(&target.node_id, INDIRECT_PROBE_HELPERS);
    if helpers.is_empty() {
        membership.mark_suspected(&target.node_id);
        return;
    }

    let mut any_success = false;
    for helper in helpers {
        if indirect_probe(&helper, &target).await {
            any_success = true;
            break;
        }
    }

    if any_success {
        membership.mark_alive(&target.node_id);
    } else {
        membership.mark_suspected(&target.node_id);
    }
}

async fn direct_probe(target: &PeerInfo) -> bool {
    let Ok(addr) = target.address.parse() else { return false };
    let attempt = async {
        let mut conn = Connection::connect(addr).await?;
        match conn.request(&Message::Probe { from: target.node_id.clone() }).await? {
            Message::ProbeResponse { success, .. } => Ok::<bool, NodeError>(success),
            _ => Ok(false),
        }
    };
    matches!(tokio::time::timeout(PROBE_TIMEOUT, attempt).await, Ok(Ok(true)))
}

async fn indirect_probe(helper: &PeerInfo, target: &PeerInfo) -> bool {
    let Ok(helper_addr) = helper.address.parse() else { return false };
    let Ok(target_addr) = target.address.parse() else { return false };
    let attempt = async {
        let mut conn = Connection::connect(helper_addr).await?;
        match conn
            .request(&Message::IndirectProbeRequest {
                from: helper.node_id.clone(),
                target: target.node_id.clone(),
                target_address: target_addr,
            })
            .await?
        {
            Message::IndirectProbeResponse { success, .. } => Ok::<bool, NodeError>(success),
            _ => Ok(false),
        }
    };
    matches!(tokio::time::timeout(PROBE_TIMEOUT, attempt).await, Ok(Ok(true)))
}

async fn handle_connection(
    mut conn: Connection,
    storage: Arc<CausalStore>,
    membership: Arc<Membership>,
    ring: Arc<HashRing>,
    data_dir: std::path::PathBuf,
    node_id: NodeId,
) -> NodeResult<()> {
    loop {
        let message = match conn.receive().await {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let response = handle_message(message, &storage, &membership, &ring, &data_dir, &node_id).await?;
        if let Some(response) = response {
            conn.send(&response).await?;
        }
    }
    Ok(())
}

async fn handle_message(
    message: Message,
    storage: &Arc<CausalStore>,
    membership: &Arc<Membership>,
    ring: &Arc<HashRing>,
    data_dir: &std::path::Path,
    node_id: &NodeId,
) -> NodeResult<Option<Message>> {
    match message {
        Message::Join { node_id: peer_id, address } => {
            ring.add(&peer_id);
            membership.note_peer(peer_id.clone(), address.to_string());
            membership.add_rumor(RumorKind::Join, peer_id, Some(address.to_string()));
            Ok(Some(Message::JoinAck { node_id: node_id.clone(), peers: membership.peers_snapshot() }))
        }

        Message::Leave { node_id: peer_id } => {
            membership.mark_dead(&peer_id);
            ring.remove(&peer_id);
            Ok(None)
        }

        Message::Heartbeat { from, heartbeat_seq, incarnation, peers, rumors } => {
            if let Some(mut known) = membership.peer(&from) {
                known.incarnation = incarnation;
                known.heartbeat_seq = heartbeat_seq;
                known.status = PeerStatus::Alive;
                known.touch();
                // The sender is trivially alive right now; bypass the
                // generic newer-record gate so a restarted peer's fresh
                // incarnation is never rejected for looking "stale".
                membership.merge_self_report(known);
            }
            for peer in peers {
                ring.add(&peer.node_id);
                membership.merge_peer(peer);
            }
            for rumor in rumors {
                if rumor.kind == RumorKind::Leave {
                    ring.remove(&rumor.payload.node_id);
                }
                membership.absorb_rumor(rumor);
            }
            Ok(None)
        }

        Message::Probe { from: _ } => Ok(Some(Message::ProbeResponse { from: node_id.clone(), success: true })),

        Message::IndirectProbeRequest { from: _, target, target_address } => {
            let success = direct_probe(&PeerInfo::new(target.clone(), target_address.to_string(), 0)).await;
            Ok(Some(Message::IndirectProbeResponse { from: node_id.clone(), target, success }))
        }

        Message::Ping { from: _ } => Ok(Some(Message::Pong { from: node_id.clone() })),

        Message::ReplicationRequest { key, value, operation, source_event, clock_snapshot, event_log_snapshot } => {
            let result = match operation {
                ReplicationOp::Put => {
                    let value = value.ok_or_else(|| NodeError::InvalidData { reason: "put without value".into() })?;
                    storage.put_replicated(&key, value, source_event.clone())
                }
                ReplicationOp::Delete => storage.delete_replicated(&key, source_event.clone()),
            };

            let (events, known_peers) = match &event_log_snapshot {
                Some(snapshot) => (snapshot.events.clone(), snapshot.known_peers.clone()),
                None => (Vec::new(), Default::default()),
            };
            if let Err(e) = storage.merge_event_log(&events, &clock_snapshot, &known_peers) {
                tracing::warn!(error = %e, "failed to merge replication clock/log snapshot");
            }

            match result {
                Ok(()) => {
                    let _ = persistence::append_event(data_dir, &source_event).await;
                    Ok(Some(Message::ReplicationResponse {
                        success: true,
                        message: "applied".into(),
                        node_id: node_id.clone(),
                        error: None,
                        updated_clock: Some(storage.current_clock()),
                    }))
                }
                Err(e) => Ok(Some(Message::ReplicationResponse {
                    success: false,
                    message: "rejected".into(),
                    node_id: node_id.clone(),
                    error: Some(e.to_string()),
                    updated_clock: None,
                })),
            }
        }

        Message::Error { message } => {
            tracing::debug!(message, "peer reported an error");
            Ok(None)
        }

        // Responses arriving here mean the peer is replying to a request
        // we sent on a connection we don't hold open; nothing to do.
        Message::JoinAck { .. }
        | Message::Pong { .. }
        | Message::ProbeResponse { .. }
        | Message::IndirectProbeResponse { .. }
        | Message::ReplicationResponse { .. } => Ok(None),
    }
}

//! SWIM-style membership: peer table, rumor mill, and the pure
//! state-transition logic the background loops in `node.rs` drive.
//!
//! All mutation goes through one lock, mirroring the single-table design
//! of the teacher's `ClusterState` (`cluster.rs`) — just swapped from a
//! `DashMap` to an `RwLock<HashMap<..>>` since every access here already
//! needs to reason about incarnation/heartbeat ordering across fields,
//! which a lock-free per-key map would not give us for free.
use crate::types::{Address, NodeId, PeerInfo, PeerStatus, Rumor, RumorKind, RumorPayload};
use chrono::Utc;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

pub const GOSSIP_INTERVAL: Duration = Duration::from_secs(1);
pub const PROBE_INTERVAL: Duration = Duration::from_secs(3);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
pub const SUSPICION_TIMEOUT: Duration = Duration::from_secs(5);
pub const FANOUT: usize = 3;
pub const INDIRECT_PROBE_HELPERS: usize = 3;
pub const RUMOR_SPREAD_LIMIT: u32 = 5;
pub const RUMOR_TTL: Duration = Duration::from_secs(300);

struct State {
    peers: HashMap<NodeId, PeerInfo>,
    rumors: Vec<Rumor>,
    suspected_since: HashMap<NodeId, chrono::DateTime<Utc>>,
}

/// A node's view of cluster membership: the peer table, its own
/// incarnation number, and the rumor mill used to spread membership
/// changes epidemically.
pub struct Membership {
    node_id: NodeId,
    address: Address,
    incarnation: RwLock<u64>,
    state: RwLock<State>,
}

impl Membership {
    pub fn new(node_id: NodeId, address: Address) -> Self {
        Self {
            node_id,
            address,
            incarnation: RwLock::new(0),
            state: RwLock::new(State {
                peers: HashMap::new(),
                rumors: Vec::new(),
                suspected_since: HashMap::new(),
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn incarnation(&self) -> u64 {
        *self.incarnation.read().expect("incarnation lock poisoned")
    }

    /// Seed our own incarnation at startup, per spec: "seconds since its
    /// start" ensures a restarted node's incarnation almost always exceeds
    /// whatever peers last observed before the crash, so `merge_peer`'s
    /// incarnation check lets the restart's `Alive` report win.
    pub fn seed_incarnation(&self, value: u64) {
        *self.incarnation.write().expect("incarnation lock poisoned") = value;
    }

    pub fn heartbeat_seq(&self) -> u64 {
        // Our own entry isn't in the peer table; callers track this
        // separately via `next_heartbeat_seq`.
        0
    }

    /// Insert or refresh a peer we learned about directly (join, or a
    /// rumor naming a brand-new node).
    pub fn note_peer(&self, node_id: NodeId, address: Address) {
        if node_id == self.node_id {
            return;
        }
        let mut state = self.state.write().expect("membership lock poisoned");
        state
            .peers
            .entry(node_id.clone())
            .or_insert_with(|| PeerInfo::new(node_id, address, 0));
    }

    /// Apply an incoming peer record from a heartbeat or announce, per the
    /// SWIM merge rule: incarnation is compared BEFORE heartbeat_seq, so a
    /// restarted node (incarnation reset, heartbeat_seq reset to 0) is
    /// still correctly recognized as newer information.
    pub fn merge_peer(&self, incoming: PeerInfo) {
        if incoming.node_id == self.node_id {
            return;
        }
        let mut state = self.state.write().expect("membership lock poisoned");
        match state.peers.get(&incoming.node_id) {
            None => {
                state.peers.insert(incoming.node_id.clone(), incoming);
            }
            Some(existing) => {
                let newer = match incoming.incarnation.cmp(&existing.incarnation) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => {
                        rank(incoming.status) > rank(existing.status)
                            || (incoming.status == existing.status
                                && incoming.heartbeat_seq > existing.heartbeat_seq)
                    }
                };
                if newer {
                    if incoming.status != PeerStatus::Suspected {
                        state.suspected_since.remove(&incoming.node_id);
                    }
                    state.peers.insert(incoming.node_id.clone(), incoming);
                }
            }
        }
    }

    /// Apply a peer's own self-reported heartbeat record unconditionally.
    /// A node that is gossiping is trivially alive right now, regardless of
    /// what our incarnation/heartbeat_seq bookkeeping thinks it knows —
    /// this bypasses `merge_peer`'s "newer" gate, which a restarted peer
    /// (fresh incarnation, but not yet proven "newer" by some comparisons)
    /// could otherwise fail.
    pub fn merge_self_report(&self, incoming: PeerInfo) {
        if incoming.node_id == self.node_id {
            return;
        }
        let mut state = self.state.write().expect("membership lock poisoned");
        state.suspected_since.remove(&incoming.node_id);
        state.peers.insert(incoming.node_id.clone(), incoming);
    }

    pub fn mark_suspected(&self, node_id: &NodeId) {
        let mut state = self.state.write().expect("membership lock poisoned");
        if let Some(peer) = state.peers.get_mut(node_id) {
            if peer.status == PeerStatus::Alive {
                peer.status = PeerStatus::Suspected;
                state.suspected_since.insert(node_id.clone(), Utc::now());
            }
        }
    }

    pub fn mark_alive(&self, node_id: &NodeId) {
        let mut state = self.state.write().expect("membership lock poisoned");
        if let Some(peer) = state.peers.get_mut(node_id) {
            peer.status = PeerStatus::Alive;
            peer.touch();
        }
        state.suspected_since.remove(node_id);
    }

    pub fn mark_dead(&self, node_id: &NodeId) {
        let mut state = self.state.write().expect("membership lock poisoned");
        if let Some(peer) = state.peers.get_mut(node_id) {
            peer.status = PeerStatus::Dead;
        }
        state.suspected_since.remove(node_id);
    }

    /// Peers that have been suspected longer than [`SUSPICION_TIMEOUT`].
    pub fn overdue_suspects(&self) -> Vec<NodeId> {
        let state = self.state.read().expect("membership lock poisoned");
        let cutoff = Utc::now() - chrono::Duration::from_std(SUSPICION_TIMEOUT).unwrap_or_default();
        state
            .suspected_since
            .iter()
            .filter(|(_, since)| **since < cutoff)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn peers_snapshot(&self) -> Vec<PeerInfo> {
        self.state.read().expect("membership lock poisoned").peers.values().cloned().collect()
    }

    pub fn alive_peers(&self) -> Vec<PeerInfo> {
        self.state
            .read()
            .expect("membership lock poisoned")
            .peers
            .values()
            .filter(|p| p.status == PeerStatus::Alive)
            .cloned()
            .collect()
    }

    pub fn peer(&self, node_id: &NodeId) -> Option<PeerInfo> {
        self.state.read().expect("membership lock poisoned").peers.get(node_id).cloned()
    }

    pub fn member_count(&self) -> usize {
        self.state.read().expect("membership lock poisoned").peers.len() + 1
    }

    /// Up to `fanout` random alive peers to gossip with this round.
    pub fn gossip_targets(&self, fanout: usize) -> Vec<PeerInfo> {
        let mut alive = self.alive_peers();
        let mut rng = rand::thread_rng();
        alive.shuffle(&mut rng);
        alive.truncate(fanout);
        alive
    }

    /// A random alive peer to probe this round, if any exist.
    pub fn probe_target(&self) -> Option<PeerInfo> {
        let alive = self.alive_peers();
        alive.choose(&mut rand::thread_rng()).cloned()
    }

    /// Up to `k` alive peers (excluding `target`) to ask for an indirect
    /// probe of `target`.
    pub fn indirect_helpers(&self, target: &NodeId, k: usize) -> Vec<PeerInfo> {
        let mut candidates: Vec<PeerInfo> =
            self.alive_peers().into_iter().filter(|p| &p.node_id != target).collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(k);
        candidates
    }

    /// Bump our own incarnation (self-refutation when a rumor or probe
    /// response wrongly suspects us) and return the new value.
    pub fn bump_incarnation(&self) -> u64 {
        let mut incarnation = self.incarnation.write().expect("incarnation lock poisoned");
        *incarnation += 1;
        *incarnation
    }

    pub fn add_rumor(&self, kind: RumorKind, node_id: NodeId, address: Option<Address>) {
        let rumor = Rumor::new(kind, RumorPayload { node_id, address }, self.node_id.clone(), RUMOR_SPREAD_LIMIT);
        self.state.write().expect("membership lock poisoned").rumors.push(rumor);
    }

    /// Rumors still worth spreading this round: not expired, not
    /// exhausted. Increments each returned rumor's spread count.
    pub fn rumors_to_spread(&self) -> Vec<Rumor> {
        let mut state = self.state.write().expect("membership lock poisoned");
        let mut spreading = Vec::new();
        for rumor in state.rumors.iter_mut() {
            if !rumor.is_expired(chrono::Duration::from_std(RUMOR_TTL).unwrap_or_default())
                && !rumor.is_exhausted()
            {
                rumor.spread_count += 1;
                spreading.push(rumor.clone());
            }
        }
        spreading
    }

    /// Apply an incoming rumor: update membership accordingly and, if
    /// it's new information, re-add it to our own rumor mill so it keeps
    /// spreading (epidemic dissemination).
    pub fn absorb_rumor(&self, rumor: Rumor) {
        match rumor.kind {
            RumorKind::Join => {
                if let Some(address) = rumor.payload.address.clone() {
                    self.note_peer(rumor.payload.node_id.clone(), address);
                }
            }
            RumorKind::Leave => {
                self.mark_dead(&rumor.payload.node_id);
            }
            RumorKind::Failure => {
                self.mark_suspected(&rumor.payload.node_id);
            }
        }

        let mut state = self.state.write().expect("membership lock poisoned");
        let already_known = state.rumors.iter().any(|r| r.id == rumor.id);
        if !already_known {
            state.rumors.push(rumor);
        }
    }

    /// Drop peers that have been `Dead` for longer than `max_age`, so the
    /// table doesn't grow without bound across a long-lived cluster.
    pub fn prune_dead_peers(&self, max_age: Duration) {
        let mut state = self.state.write().expect("membership lock poisoned");
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        state
            .peers
            .retain(|_, peer| !(peer.status == PeerStatus::Dead && peer.last_seen_wall < cutoff));
    }

    pub fn prune_expired_rumors(&self) {
        let mut state = self.state.write().expect("membership lock poisoned");
        let ttl = chrono::Duration::from_std(RUMOR_TTL).unwrap_or_default();
        state.rumors.retain(|r| !r.is_expired(ttl) && !r.is_exhausted());
    }
}

fn rank(status: PeerStatus) -> u8 {
    match status {
        PeerStatus::Alive => 0,
        PeerStatus::Suspected => 1,
        PeerStatus::Dead => 2,
    }
}

//! Local KV store with an attached causal event log.
//!
//! The log is the source of truth for causality; the flat KV map is a
//! last-writer-wins projection of it. All mutations are linearized within
//! one process by a single storage lock (see the lock ordering note in
//! `node.rs`: storage before ring before gossip before health).
use crate::error::{NodeError, NodeResult};
use crate::types::{
    ClockOrdering, Event, EventKind, NodeId, StoredValue, StoredValueMetadata, VectorClock,
};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// A maximal set of pairwise-concurrent put events on the same key.
#[derive(Debug, Clone)]
pub struct ConflictSet {
    pub key: String,
    pub events: Vec<Event>,
    pub detected_wall: DateTime<Utc>,
}

/// Append-only ordered sequence of events, plus the node's current vector
/// clock and the set of peers it has exchanged logs with.
///
/// Invariant: `clock` equals the componentwise max of all events in the
/// log, grouped by their originating node.
struct EventLog {
    events: Vec<Event>,
    ids: HashSet<String>,
    clock: VectorClock,
    known_peers: HashSet<NodeId>,
    seq: u64,
}

impl EventLog {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            ids: HashSet::new(),
            clock: VectorClock::new(),
            known_peers: HashSet::new(),
            seq: 0,
        }
    }

    fn next_event_id(&mut self, node_id: &NodeId) -> String {
        self.seq += 1;
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("{node_id}-{nanos}-{}", self.seq)
    }

    /// Appends `event` unconditionally, recording it as a local tick.
    fn append_local(&mut self, event: Event) {
        self.ids.insert(event.id.clone());
        self.events.push(event);
    }

    /// Appends `event` only if its id is not already present. Returns
    /// whether it was newly applied.
    fn append_if_new(&mut self, event: Event) -> bool {
        if self.ids.contains(&event.id) {
            return false;
        }
        self.ids.insert(event.id.clone());
        self.events.push(event);
        true
    }

    fn merge(&mut self, other_events: &[Event], other_clock: &VectorClock, other_peers: &HashSet<NodeId>) {
        self.clock.merge(other_clock);
        self.known_peers.extend(other_peers.iter().cloned());

        for event in other_events {
            self.append_if_new(event.clone());
        }

        self.events.sort_by(|a, b| causal_order(a, b));
    }
}

/// Deterministic total order used to re-sort the log after a merge:
/// happens-before orders causally related events; concurrent events tie
/// break on wall time, then origin node id.
fn causal_order(a: &Event, b: &Event) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match a.clock_snapshot.compare(&b.clock_snapshot) {
        ClockOrdering::Before => Ordering::Less,
        ClockOrdering::After => Ordering::Greater,
        ClockOrdering::Equal | ClockOrdering::Concurrent => a
            .wall_time
            .cmp(&b.wall_time)
            .then_with(|| a.origin_node.cmp(&b.origin_node)),
    }
}

struct Inner {
    log: EventLog,
    kv: HashMap<String, StoredValue>,
}

/// The local KV store with its attached causal event log.
pub struct CausalStore {
    node_id: NodeId,
    inner: RwLock<Inner>,
}

impl CausalStore {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            inner: RwLock::new(Inner {
                log: EventLog::new(),
                kv: HashMap::new(),
            }),
        }
    }

    /// Ticks the local clock, appends a `put` event, and overwrites the KV
    /// projection. Returns the created event directly so callers never need
    /// to re-read the log tail (the race the original design note warns
    /// about).
    pub fn put(&self, key: &str, value: JsonValue) -> NodeResult<Event> {
        let mut inner = self.inner.write().map_err(|_| NodeError::StorageError("lock poisoned".into()))?;
        inner.log.clock.tick(&self.node_id);
        let clock_snapshot = inner.log.clock.clone();
        let id = inner.log.next_event_id(&self.node_id);
        let event = Event::new(
            id,
            EventKind::Put,
            key.to_string(),
            Some(value.clone()),
            self.node_id.clone(),
            clock_snapshot.clone(),
            Utc::now(),
        );
        inner.log.append_local(event.clone());
        inner.kv.insert(
            key.to_string(),
            StoredValue {
                value,
                wall_ts: event.wall_time,
                version: event.id.clone(),
                metadata: StoredValueMetadata {
                    origin_node: self.node_id.clone(),
                    event_id: event.id.clone(),
                    clock_snapshot_string: clock_string(&clock_snapshot),
                    replicated_flag: false,
                },
            },
        );
        Ok(event)
    }

    /// Applies a peer-originated write. Does NOT tick the local clock; the
    /// `source_event` is reused verbatim and deduplicated by id. This is
    /// the only correct entry point for replicated writes — ticking here
    /// would make one client write look like N concurrent events.
    pub fn put_replicated(&self, key: &str, value: JsonValue, source_event: Event) -> NodeResult<()> {
        let mut inner = self.inner.write().map_err(|_| NodeError::StorageError("lock poisoned".into()))?;
        let clock_snapshot_string = clock_string(&source_event.clock_snapshot);
        let metadata = StoredValueMetadata {
            origin_node: source_event.origin_node.clone(),
            event_id: source_event.id.clone(),
            clock_snapshot_string,
            replicated_flag: true,
        };
        inner.log.append_if_new(source_event.clone());
        inner.kv.insert(
            key.to_string(),
            StoredValue {
                value,
                wall_ts: source_event.wall_time,
                version: source_event.id,
                metadata,
            },
        );
        Ok(())
    }

    /// Ticks the local clock, appends a `get` event, and returns the
    /// current value, if any.
    pub fn get(&self, key: &str) -> NodeResult<Option<StoredValue>> {
        let mut inner = self.inner.write().map_err(|_| NodeError::StorageError("lock poisoned".into()))?;
        inner.log.clock.tick(&self.node_id);
        let clock_snapshot = inner.log.clock.clone();
        let id = inner.log.next_event_id(&self.node_id);
        let event = Event::new(
            id,
            EventKind::Get,
            key.to_string(),
            None,
            self.node_id.clone(),
            clock_snapshot,
            Utc::now(),
        );
        inner.log.append_local(event);
        Ok(inner.kv.get(key).cloned())
    }

    /// Ticks the local clock, appends a `delete` event, and removes the
    /// key from the KV projection. Returns the created event.
    pub fn delete(&self, key: &str) -> NodeResult<Event> {
        let mut inner = self.inner.write().map_err(|_| NodeError::StorageError("lock poisoned".into()))?;
        inner.log.clock.tick(&self.node_id);
        let clock_snapshot = inner.log.clock.clone();
        let id = inner.log.next_event_id(&self.node_id);
        let event = Event::new(
            id,
            EventKind::Delete,
            key.to_string(),
            None,
            self.node_id.clone(),
            clock_snapshot,
            Utc::now(),
        );
        inner.log.append_local(event.clone());
        inner.kv.remove(key);
        Ok(event)
    }

    /// Symmetric to `put_replicated`: applies a peer-originated delete
    /// without ticking the local clock.
    pub fn delete_replicated(&self, key: &str, source_event: Event) -> NodeResult<()> {
        let mut inner = self.inner.write().map_err(|_| NodeError::StorageError("lock poisoned".into()))?;
        inner.log.append_if_new(source_event);
        inner.kv.remove(key);
        Ok(())
    }

    /// Merges another node's event log into this one: clocks merge
    /// componentwise, known peers union, new events (by id) are appended,
    /// and the full log is re-sorted into causal order.
    pub fn merge_event_log(&self, other_events: &[Event], other_clock: &VectorClock, other_peers: &HashSet<NodeId>) -> NodeResult<()> {
        let mut inner = self.inner.write().map_err(|_| NodeError::StorageError("lock poisoned".into()))?;
        inner.log.merge(other_events, other_clock, other_peers);
        Ok(())
    }

    pub fn note_peer(&self, peer: &NodeId) -> NodeResult<()> {
        let mut inner = self.inner.write().map_err(|_| NodeError::StorageError("lock poisoned".into()))?;
        inner.log.known_peers.insert(peer.clone());
        Ok(())
    }

    pub fn current_clock(&self) -> VectorClock {
        self.inner.read().expect("storage lock poisoned").log.clock.clone()
    }

    pub fn events_snapshot(&self) -> Vec<Event> {
        self.inner.read().expect("storage lock poisoned").log.events.clone()
    }

    pub fn known_peers_snapshot(&self) -> HashSet<NodeId> {
        self.inner.read().expect("storage lock poisoned").log.known_peers.clone()
    }

    pub fn event_count(&self) -> usize {
        self.inner.read().expect("storage lock poisoned").log.events.len()
    }

    /// Groups `put` events by key and finds every maximal subset of
    /// pairwise-concurrent events within each group (size >= 2), via
    /// Bron-Kerbosch maximal clique enumeration over the "concurrent with"
    /// relation.
    pub fn detect_conflicts(&self) -> Vec<ConflictSet> {
        let inner = self.inner.read().expect("storage lock poisoned");
        let mut by_key: HashMap<&str, Vec<&Event>> = HashMap::new();
        for event in &inner.log.events {
            if event.kind == EventKind::Put {
                by_key.entry(event.key.as_str()).or_default().push(event);
            }
        }

        let mut result = Vec::new();
        for (key, events) in by_key {
            if events.len() < 2 {
                continue;
            }
            let n = events.len();
            let mut adjacency = vec![vec![false; n]; n];
            for i in 0..n {
                for j in (i + 1)..n {
                    if events[i].clock_snapshot.is_concurrent_with(&events[j].clock_snapshot) {
                        adjacency[i][j] = true;
                        adjacency[j][i] = true;
                    }
                }
            }

            let mut cliques = Vec::new();
            bron_kerbosch(
                &adjacency,
                &mut (0..n).collect(),
                &mut Vec::new(),
                &mut Vec::new(),
                &mut cliques,
            );

            for clique in cliques {
                if clique.len() < 2 {
                    continue;
                }
                result.push(ConflictSet {
                    key: key.to_string(),
                    events: clique.iter().map(|&i| events[i].clone()).collect(),
                    detected_wall: Utc::now(),
                });
            }
        }
        result
    }
}

fn clock_string(clock: &VectorClock) -> String {
    let mut entries: Vec<(&String, &u64)> = clock.clocks.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Standard Bron-Kerbosch without pivoting; the conflict sets this spec
/// cares about are small (a handful of concurrent writers per key), so the
/// worst-case exponential blowup is not a practical concern here.
fn bron_kerbosch(
    adjacency: &[Vec<bool>],
    candidates: &mut Vec<usize>,
    excluded: &mut Vec<usize>,
    current: &mut Vec<usize>,
    cliques: &mut Vec<Vec<usize>>,
) {
    if candidates.is_empty() && excluded.is_empty() {
        if !current.is_empty() {
            cliques.push(current.clone());
        }
        return;
    }

    let candidates_snapshot = candidates.clone();
    for v in candidates_snapshot {
        let neighbors: Vec<usize> = (0..adjacency.len()).filter(|&u| adjacency[v][u]).collect();

        current.push(v);
        let mut next_candidates: Vec<usize> =
            candidates.iter().filter(|c| neighbors.contains(c)).copied().collect();
        let mut next_excluded: Vec<usize> =
            excluded.iter().filter(|c| neighbors.contains(c)).copied().collect();
        bron_kerbosch(adjacency, &mut next_candidates, &mut next_excluded, current, cliques);
        current.pop();

        candidates.retain(|&c| c != v);
        excluded.push(v);
    }
}

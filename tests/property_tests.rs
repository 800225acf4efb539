//! Property-based checks for the two invariants spec.md calls out as
//! holding "for any execution of any size": ring balance and merge
//! commutativity.
use dynamo_lite::{CausalStore, HashRing};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;

proptest! {
    #[test]
    fn ring_balance_holds_for_random_node_and_key_counts(
        node_count in 3usize..8,
        key_count in 200usize..2000,
        seed in 0u64..10_000,
    ) {
        let ring = HashRing::new();
        let nodes: Vec<String> = (0..node_count).map(|i| format!("node-{i}")).collect();
        for node in &nodes {
            ring.add(node);
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..key_count {
            let key = format!("key-{seed}-{i}");
            let owner = ring.owner(&key).unwrap();
            *counts.entry(owner).or_insert(0) += 1;
        }

        let expected = key_count as f64 / node_count as f64;
        for count in counts.values() {
            let share = *count as f64 / expected;
            prop_assert!((0.5..=1.5).contains(&share), "share {share} outside tolerance");
        }
    }

    #[test]
    fn merge_is_commutative_for_random_event_sequences(
        a_values in prop::collection::vec(0i64..1000, 1..10),
        b_values in prop::collection::vec(0i64..1000, 1..10),
    ) {
        let a = CausalStore::new("a".to_string());
        for v in &a_values {
            a.put("k", json!(v)).unwrap();
        }
        let b = CausalStore::new("b".to_string());
        for v in &b_values {
            b.put("k", json!(v)).unwrap();
        }

        let a_events = a.events_snapshot();
        let a_clock = a.current_clock();
        let b_events = b.events_snapshot();
        let b_clock = b.current_clock();

        let merged_ab = CausalStore::new("merge".to_string());
        merged_ab.merge_event_log(&a_events, &a_clock, &Default::default()).unwrap();
        merged_ab.merge_event_log(&b_events, &b_clock, &Default::default()).unwrap();

        let merged_ba = CausalStore::new("merge".to_string());
        merged_ba.merge_event_log(&b_events, &b_clock, &Default::default()).unwrap();
        merged_ba.merge_event_log(&a_events, &a_clock, &Default::default()).unwrap();

        prop_assert_eq!(merged_ab.current_clock(), merged_ba.current_clock());

        let mut ids_ab: Vec<_> = merged_ab.events_snapshot().iter().map(|e| e.id.clone()).collect();
        let mut ids_ba: Vec<_> = merged_ba.events_snapshot().iter().map(|e| e.id.clone()).collect();
        ids_ab.sort();
        ids_ba.sort();
        prop_assert_eq!(ids_ab, ids_ba);
    }
}

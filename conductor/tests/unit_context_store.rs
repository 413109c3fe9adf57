//! Unit Tests for the Context Store
//!
//! Covers tier placement, compression, overflow, demotion and collection.

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::json;

use conductor::config::ContextConfig;
use conductor::context::{ContextStore, ContextTier, Payload, TierPolicy};
use conductor::ConductorError;

fn small_policy() -> TierPolicy {
    TierPolicy {
        hot_max_bytes: 64,
        warm_max_bytes: 1_024,
        cold_max_bytes: 8_192,
        compression_threshold_bytes: 2_048,
        max_entry_bytes: 1_000_000,
        hot_budget_bytes: 100,
    }
}

#[test]
fn test_placement_by_size() {
    let store = ContextStore::with_policy(small_policy());

    let hot = store.put("a", json!("x"), "phase-1").unwrap();
    let warm = store.put("b", json!("x".repeat(200)), "phase-2").unwrap();

    assert_eq!(hot.tier, ContextTier::Hot);
    assert_eq!(warm.tier, ContextTier::Warm);
    assert!(!warm.is_compressed());
}

#[test]
fn test_large_entries_are_compressed() {
    let store = ContextStore::new(&ContextConfig::default());
    let value = json!({ "report": "lorem ipsum ".repeat(10_000) });

    let entry = store.put("phase-1.output", value.clone(), "phase-1").unwrap();

    assert!(entry.is_compressed());
    assert!(matches!(entry.payload, Payload::Gzip { .. }));
    assert!(entry.stored_bytes < entry.size_bytes);
    assert!(entry.tier >= ContextTier::Warm);
    assert_eq!(store.read("phase-1.output").unwrap(), value);
    assert_eq!(store.statistics().compressions, 1);
}

#[test]
fn test_overflow_when_compression_cannot_fit() {
    let mut policy = small_policy();
    policy.max_entry_bytes = 16;
    let store = ContextStore::with_policy(policy);

    let result = store.put("big", json!("some text that will not fit"), "phase-1");
    assert!(matches!(
        result,
        Err(ConductorError::ContextOverflow { ceiling_bytes: 16, .. })
    ));
    assert!(!store.contains("big"));
}

#[test]
fn test_rewrite_produces_new_version() {
    let store = ContextStore::default();
    store.put("k", json!(1), "phase-1").unwrap();
    let second = store.put("k", json!(2), "phase-1").unwrap();

    assert_eq!(second.version, 2);
    assert_eq!(store.read("k").unwrap(), json!(2));
}

#[test]
fn test_foreign_writer_rejected() {
    let store = ContextStore::default();
    store.put("k", json!(1), "phase-1").unwrap();

    assert!(matches!(
        store.put("k", json!(2), "phase-2"),
        Err(ConductorError::ContextOwnership { owner, writer, .. }) if owner == "phase-1" && writer == "phase-2"
    ));
    assert_eq!(store.read("k").unwrap(), json!(1));
}

#[test]
fn test_archive_keeps_value_and_bumps_version() {
    let store = ContextStore::default();
    let original = store.put("k", json!({"notes": ["a", "b"]}), "phase-1").unwrap();

    let archived = store.archive("k").unwrap();

    assert_eq!(archived.tier, ContextTier::Archive);
    assert!(archived.is_compressed());
    assert_eq!(archived.version, original.version + 1);
    assert_eq!(archived.value().unwrap(), json!({"notes": ["a", "b"]}));
    // The earlier version is untouched
    assert_eq!(original.tier, ContextTier::Hot);
    assert!(!original.is_compressed());
}

#[test]
fn test_demote_to_warmer_tier_is_noop() {
    let store = ContextStore::default();
    store.put("k", json!(1), "phase-1").unwrap();
    store.demote("k", ContextTier::Cold).unwrap();

    let entry = store.demote("k", ContextTier::Warm).unwrap();
    assert_eq!(entry.tier, ContextTier::Cold);
    assert!(matches!(
        store.demote("missing", ContextTier::Cold),
        Err(ConductorError::ContextNotFound { .. })
    ));
}

#[test]
fn test_hot_budget_demotes_least_recently_used() {
    let store = ContextStore::with_policy(small_policy());
    for (key, phase) in [("a", "phase-1"), ("b", "phase-2"), ("c", "phase-3")] {
        store.put(key, json!("y".repeat(50)), phase).unwrap();
        std::thread::sleep(Duration::from_millis(2));
    }
    store.get("a");

    let demoted = store.enforce_hot_budget().unwrap();

    assert_eq!(demoted, vec!["b", "c"]);
    assert_eq!(store.get("a").unwrap().tier, ContextTier::Hot);
    assert_eq!(store.get("b").unwrap().tier, ContextTier::Warm);
    assert!(store.enforce_hot_budget().unwrap().is_empty());
}

#[test]
fn test_snapshot_skips_absent_keys() {
    let store = ContextStore::default();
    store.put("present", json!("v"), "phase-1").unwrap();

    let keys = vec!["present".to_string(), "absent".to_string()];
    let snapshot = store.snapshot(&keys).unwrap();

    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot["present"], json!("v"));
}

#[test]
fn test_snapshot_is_a_copy() {
    let store = ContextStore::default();
    store.put("k", json!({"n": 1}), "phase-1").unwrap();

    let keys = vec!["k".to_string()];
    let mut snapshot = store.snapshot(&keys).unwrap();
    snapshot.insert("k".into(), json!({"n": 2}));

    assert_eq!(store.read("k").unwrap(), json!({"n": 1}));
}

#[test]
fn test_garbage_collection() {
    let store = ContextStore::default();
    for key in ["a", "b", "c"] {
        store.put(key, json!(key), key).unwrap();
    }

    let live: BTreeSet<String> = ["b".to_string()].into_iter().collect();
    assert_eq!(store.collect_garbage(&live), 2);
    assert_eq!(store.keys(), vec!["b"]);

    store.clear();
    assert!(store.is_empty());
    assert_eq!(store.statistics().collected, 3);
}

#[test]
fn test_export_import() {
    let store = ContextStore::default();
    store.put("b", json!("x".repeat(100_000)), "phase-2").unwrap();
    store.put("a", json!(1), "phase-1").unwrap();

    let exported = store.export();
    let keys: Vec<&str> = exported.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b"]);

    let json = serde_json::to_string(&exported).unwrap();
    let restored = ContextStore::default();
    restored.import(serde_json::from_str::<Vec<_>>(&json).unwrap());

    assert_eq!(restored.read("b").unwrap(), json!("x".repeat(100_000)));
    assert!(restored.get("b").unwrap().is_compressed());
}

#[test]
fn test_statistics_track_hits_and_misses() {
    let store = ContextStore::default();
    store.put("k", json!(1), "phase-1").unwrap();
    store.get("k");
    store.get("nope");

    let stats = store.statistics();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entries_by_tier[&ContextTier::Hot], 1);
}

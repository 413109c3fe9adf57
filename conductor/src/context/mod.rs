//! Context Store - Tiered Storage for Phase Outputs
//!
//! Holds the outputs phases publish under their `output_context_key`. Entries
//! are placed in a tier by size, compressed above a threshold, and can be
//! demoted to colder tiers as the run progresses.
//!
//! # Invariants
//!
//! - Each key has exactly one producing phase; writes from any other phase fail
//! - Readers receive copies; a published entry is never modified in place
//! - An entry larger than `max_entry_bytes` after compression is rejected
//!
//! One store is created per execution run and shared by its phase tasks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ContextConfig;
use crate::error::{ConductorError, Result};

pub mod codec;
pub mod entry;

pub use entry::{ContextEntry, ContextTier, Payload, TierPolicy};

/// Decoded copies of the entries a phase declared as inputs
pub type ContextSnapshot = BTreeMap<String, Value>;

#[derive(Debug)]
struct Slot {
    entry: Arc<ContextEntry>,
    last_accessed: DateTime<Utc>,
    access_count: u64,
}

impl Slot {
    fn new(entry: ContextEntry) -> Self {
        Self {
            entry: Arc::new(entry),
            last_accessed: Utc::now(),
            access_count: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    compressions: u64,
    demotions: u64,
    collected: u64,
}

/// Tiered key/value store for phase outputs
#[derive(Debug)]
pub struct ContextStore {
    slots: DashMap<String, Slot>,
    policy: TierPolicy,
    counters: Mutex<Counters>,
}

impl ContextStore {
    /// Create a store using the given size policy
    pub fn new(config: &ContextConfig) -> Self {
        Self::with_policy(TierPolicy::from(config))
    }

    pub fn with_policy(policy: TierPolicy) -> Self {
        Self {
            slots: DashMap::new(),
            policy,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Publish `value` under `key` on behalf of `producer`
    ///
    /// Rewriting a key is only allowed for its original producer and yields
    /// the next version.
    pub fn put(&self, key: &str, value: Value, producer: &str) -> Result<Arc<ContextEntry>> {
        let previous_version = match self.slots.get(key) {
            Some(slot) if slot.entry.produced_by_phase != producer => {
                return Err(ConductorError::ContextOwnership {
                    key: key.to_string(),
                    owner: slot.entry.produced_by_phase.clone(),
                    writer: producer.to_string(),
                });
            }
            Some(slot) => slot.entry.version,
            None => 0,
        };

        let raw = serde_json::to_vec(&value)?;
        let size_bytes = raw.len();

        let (payload, stored_bytes) = if self.policy.should_compress(size_bytes) {
            let data = codec::compress(&raw)?;
            let stored = data.len();
            if stored > self.policy.max_entry_bytes {
                warn!(key = %key, size_bytes, stored, "Context entry exceeds ceiling after compression");
                return Err(ConductorError::ContextOverflow {
                    key: key.to_string(),
                    size_bytes: stored,
                    ceiling_bytes: self.policy.max_entry_bytes,
                });
            }
            self.counters.lock().compressions += 1;
            (Payload::Gzip { data }, stored)
        } else {
            (Payload::Inline { value }, size_bytes)
        };

        let tier = self.policy.place(size_bytes, payload.is_compressed());
        let entry = ContextEntry {
            key: key.to_string(),
            payload,
            size_bytes,
            stored_bytes,
            tier,
            produced_by_phase: producer.to_string(),
            created_at: Utc::now(),
            version: previous_version + 1,
        };

        debug!(
            key = %key,
            producer = %producer,
            size_bytes,
            stored_bytes,
            tier = %tier,
            "Stored context entry"
        );

        let slot = Slot::new(entry);
        let published = Arc::clone(&slot.entry);
        self.slots.insert(key.to_string(), slot);
        Ok(published)
    }

    /// Insert previously exported entries as-is, replacing existing keys
    pub fn import<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = ContextEntry>,
    {
        let mut count = 0;
        for entry in entries {
            self.slots.insert(entry.key.clone(), Slot::new(entry));
            count += 1;
        }
        debug!(count, "Imported context entries");
        count
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Current entry for `key`, updating access statistics
    pub fn get(&self, key: &str) -> Option<Arc<ContextEntry>> {
        match self.slots.get_mut(key) {
            Some(mut slot) => {
                slot.last_accessed = Utc::now();
                slot.access_count += 1;
                self.counters.lock().hits += 1;
                Some(Arc::clone(&slot.entry))
            }
            None => {
                self.counters.lock().misses += 1;
                None
            }
        }
    }

    /// Decoded copy of the payload stored under `key`
    pub fn read(&self, key: &str) -> Result<Value> {
        let entry = self.get(key).ok_or_else(|| ConductorError::ContextNotFound {
            key: key.to_string(),
        })?;
        entry.value()
    }

    /// Decoded copies of `keys`; absent keys are left out
    pub fn snapshot<'a, I>(&self, keys: I) -> Result<ContextSnapshot>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut snapshot = ContextSnapshot::new();
        for key in keys {
            if let Some(entry) = self.get(key) {
                snapshot.insert(key.clone(), entry.value()?);
            }
        }
        Ok(snapshot)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.slots.iter().map(|s| s.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Copies of all entries ordered by key
    pub fn export(&self) -> Vec<ContextEntry> {
        let mut entries: Vec<ContextEntry> = self
            .slots
            .iter()
            .map(|slot| slot.entry.as_ref().clone())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    // ========================================================================
    // Tiering
    // ========================================================================

    /// Move `key` to a colder tier, compressing when the tier requires it
    ///
    /// Demoting to the current or a warmer tier returns the entry unchanged.
    pub fn demote(&self, key: &str, tier: ContextTier) -> Result<Arc<ContextEntry>> {
        let mut slot = self
            .slots
            .get_mut(key)
            .ok_or_else(|| ConductorError::ContextNotFound {
                key: key.to_string(),
            })?;

        if tier <= slot.entry.tier {
            return Ok(Arc::clone(&slot.entry));
        }

        let was_compressed = slot.entry.is_compressed();
        let next = slot.entry.demoted(tier)?;
        debug!(
            key = %key,
            from = %slot.entry.tier,
            to = %tier,
            version = next.version,
            "Demoted context entry"
        );

        slot.entry = Arc::new(next);
        let mut counters = self.counters.lock();
        counters.demotions += 1;
        if !was_compressed && slot.entry.is_compressed() {
            counters.compressions += 1;
        }
        Ok(Arc::clone(&slot.entry))
    }

    /// Move an entry whose consumers have all finished to the archive tier
    pub fn archive(&self, key: &str) -> Result<Arc<ContextEntry>> {
        self.demote(key, ContextTier::Archive)
    }

    /// Demote least recently used hot entries until the hot tier fits its budget
    ///
    /// Returns the demoted keys.
    pub fn enforce_hot_budget(&self) -> Result<Vec<String>> {
        let mut hot: Vec<(String, DateTime<Utc>, usize)> = self
            .slots
            .iter()
            .filter(|slot| slot.entry.tier == ContextTier::Hot)
            .map(|slot| (slot.key().clone(), slot.last_accessed, slot.entry.stored_bytes))
            .collect();

        let mut hot_bytes: usize = hot.iter().map(|(_, _, size)| size).sum();
        if hot_bytes <= self.policy.hot_budget_bytes {
            return Ok(Vec::new());
        }

        hot.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut demoted = Vec::new();
        for (key, _, size) in hot {
            if hot_bytes <= self.policy.hot_budget_bytes {
                break;
            }
            self.demote(&key, ContextTier::Warm)?;
            hot_bytes -= size;
            demoted.push(key);
        }

        info!(demoted = demoted.len(), hot_bytes, "Hot tier budget enforced");
        Ok(demoted)
    }

    // ========================================================================
    // Removal
    // ========================================================================

    pub fn remove(&self, key: &str) -> Option<Arc<ContextEntry>> {
        self.slots.remove(key).map(|(_, slot)| slot.entry)
    }

    /// Drop every entry whose key is not in `live`
    pub fn collect_garbage(&self, live: &BTreeSet<String>) -> usize {
        let before = self.slots.len();
        self.slots.retain(|key, _| live.contains(key));
        let removed = before - self.slots.len();

        self.counters.lock().collected += removed as u64;
        info!(removed, retained = self.slots.len(), "Context garbage collected");
        removed
    }

    pub fn clear(&self) {
        self.collect_garbage(&BTreeSet::new());
    }

    /// Store statistics
    pub fn statistics(&self) -> ContextStatistics {
        let mut bytes_by_tier = BTreeMap::new();
        let mut entries_by_tier = BTreeMap::new();
        let mut total_bytes = 0;
        let mut stored_bytes = 0;

        for slot in self.slots.iter() {
            let entry = &slot.entry;
            *bytes_by_tier.entry(entry.tier).or_insert(0) += entry.stored_bytes;
            *entries_by_tier.entry(entry.tier).or_insert(0) += 1;
            total_bytes += entry.size_bytes;
            stored_bytes += entry.stored_bytes;
        }

        let counters = self.counters.lock();
        ContextStatistics {
            entries: self.slots.len(),
            total_bytes,
            stored_bytes,
            bytes_by_tier,
            entries_by_tier,
            hits: counters.hits,
            misses: counters.misses,
            compressions: counters.compressions,
            demotions: counters.demotions,
            collected: counters.collected,
        }
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::with_policy(TierPolicy::default())
    }
}

/// Context store statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextStatistics {
    pub entries: usize,
    pub total_bytes: usize,
    pub stored_bytes: usize,
    pub bytes_by_tier: BTreeMap<ContextTier, usize>,
    pub entries_by_tier: BTreeMap<ContextTier, usize>,
    pub hits: u64,
    pub misses: u64,
    pub compressions: u64,
    pub demotions: u64,
    pub collected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_and_read() {
        let store = ContextStore::default();
        let entry = store.put("phase-1.output", json!({"plan": "x"}), "phase-1").unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.tier, ContextTier::Hot);
        assert_eq!(store.read("phase-1.output").unwrap(), json!({"plan": "x"}));
    }

    #[test]
    fn test_single_writer() {
        let store = ContextStore::default();
        store.put("k", json!(1), "phase-1").unwrap();
        let err = store.put("k", json!(2), "phase-2").unwrap_err();
        assert!(matches!(err, ConductorError::ContextOwnership { .. }));

        let rewritten = store.put("k", json!(3), "phase-1").unwrap();
        assert_eq!(rewritten.version, 2);
    }

    #[test]
    fn test_missing_key() {
        let store = ContextStore::default();
        assert!(matches!(
            store.read("nope"),
            Err(ConductorError::ContextNotFound { .. })
        ));
        assert_eq!(store.statistics().misses, 1);
    }
}

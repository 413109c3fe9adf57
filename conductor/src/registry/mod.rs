//! Capability Registry - Index of Worker Descriptors
//!
//! Maintains the set of workers that phases can be bound to, indexed by
//! capability tag. The registry is read-mostly: lookups take a shared lock,
//! registration and reload take an exclusive one.
//!
//! # Lifecycle
//!
//! - Load at startup (`load_from_path` or `register`)
//! - Reload on explicit refresh (`refresh`, `reload_from_path`)
//!
//! Descriptors are handed out as `Arc<WorkerDescriptor>` and are never mutated
//! after registration.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConductorError, Result};

pub mod descriptor;

pub use descriptor::{normalize_tag, ResourceTier, WorkerDescriptor, GENERAL_CAPABILITY};

// ============================================================================
// Registry Index
// ============================================================================

#[derive(Debug, Default)]
struct RegistryIndex {
    /// Workers indexed by id
    workers: BTreeMap<String, Arc<WorkerDescriptor>>,

    /// Capability index: capability -> worker ids
    capability_index: HashMap<String, BTreeSet<String>>,
}

impl RegistryIndex {
    fn insert(&mut self, descriptor: WorkerDescriptor) -> Result<()> {
        if self.workers.contains_key(&descriptor.id) {
            return Err(ConductorError::DuplicateWorker { id: descriptor.id });
        }

        for capability in &descriptor.capabilities {
            self.capability_index
                .entry(capability.clone())
                .or_default()
                .insert(descriptor.id.clone());
        }

        self.workers.insert(descriptor.id.clone(), Arc::new(descriptor));
        Ok(())
    }

    fn remove(&mut self, id: &str) -> Option<Arc<WorkerDescriptor>> {
        let descriptor = self.workers.remove(id)?;

        for capability in &descriptor.capabilities {
            if let Some(ids) = self.capability_index.get_mut(capability) {
                ids.remove(id);
                if ids.is_empty() {
                    self.capability_index.remove(capability);
                }
            }
        }

        Some(descriptor)
    }
}

// ============================================================================
// Registry File
// ============================================================================

/// On-disk registry layout (TOML, YAML or JSON)
///
/// ```toml
/// [[workers]]
/// id = "system-architect"
/// capabilities = ["architecture", "design"]
/// resource_tier = "heavy"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub workers: Vec<WorkerDescriptor>,
}

impl RegistryFile {
    /// Read a registry file, choosing the format from the extension
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let file = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            other => {
                return Err(ConductorError::config(format!(
                    "Unsupported registry file extension {:?} for {}",
                    other,
                    path.display()
                )))
            }
        };

        Ok(file)
    }
}

// ============================================================================
// Capability Registry
// ============================================================================

/// Registry of worker descriptors indexed by capability
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    index: RwLock<RegistryIndex>,
}

impl CapabilityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from descriptors, failing on duplicate ids
    pub fn from_descriptors<I>(descriptors: I) -> Result<Self>
    where
        I: IntoIterator<Item = WorkerDescriptor>,
    {
        let registry = Self::new();
        for descriptor in descriptors {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    /// Load a registry from a file
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let file = RegistryFile::read(path)?;
        let registry = Self::from_descriptors(file.workers)?;
        info!(
            "Loaded {} workers from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a worker
    pub fn register(&self, descriptor: WorkerDescriptor) -> Result<()> {
        let descriptor = descriptor.normalized();
        debug!(
            worker = %descriptor.id,
            tier = %descriptor.resource_tier,
            capabilities = descriptor.capabilities.len(),
            "Registering worker"
        );
        self.index.write().insert(descriptor)
    }

    /// Remove a worker, returning its descriptor
    pub fn unregister(&self, id: &str) -> Result<Arc<WorkerDescriptor>> {
        let removed = self
            .index
            .write()
            .remove(id)
            .ok_or_else(|| ConductorError::WorkerNotFound { id: id.to_string() })?;
        info!(worker = %id, "Worker unregistered");
        Ok(removed)
    }

    /// Replace the whole registry contents atomically
    ///
    /// The new index is built before the swap, so a duplicate id leaves the
    /// current contents untouched.
    pub fn refresh<I>(&self, descriptors: I) -> Result<()>
    where
        I: IntoIterator<Item = WorkerDescriptor>,
    {
        let mut fresh = RegistryIndex::default();
        for descriptor in descriptors {
            fresh.insert(descriptor.normalized())?;
        }

        let count = fresh.workers.len();
        *self.index.write() = fresh;
        info!("Registry refreshed with {} workers", count);
        Ok(())
    }

    /// Reload the registry from a file
    pub fn reload_from_path(&self, path: &Path) -> Result<()> {
        let file = RegistryFile::read(path)?;
        self.refresh(file.workers)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Get a worker by id
    pub fn get(&self, id: &str) -> Result<Arc<WorkerDescriptor>> {
        self.index
            .read()
            .workers
            .get(id)
            .cloned()
            .ok_or_else(|| ConductorError::WorkerNotFound { id: id.to_string() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.read().workers.contains_key(id)
    }

    /// All workers carrying `tag`, ordered by id. Empty if none.
    pub fn find_by_capability(&self, tag: &str) -> Vec<Arc<WorkerDescriptor>> {
        let index = self.index.read();
        index
            .capability_index
            .get(&normalize_tag(tag))
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.workers.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All workers, ordered by id
    pub fn all(&self) -> Vec<Arc<WorkerDescriptor>> {
        self.index.read().workers.values().cloned().collect()
    }

    /// The general-purpose worker used when nothing else matches
    pub fn default_worker(&self) -> Option<Arc<WorkerDescriptor>> {
        self.find_by_capability(GENERAL_CAPABILITY).into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.index.read().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().workers.is_empty()
    }

    /// Registry statistics
    pub fn statistics(&self) -> RegistryStatistics {
        let index = self.index.read();
        let mut workers_by_tier = BTreeMap::new();
        for worker in index.workers.values() {
            *workers_by_tier.entry(worker.resource_tier).or_insert(0) += 1;
        }

        RegistryStatistics {
            total_workers: index.workers.len(),
            distinct_capabilities: index.capability_index.len(),
            general_purpose_workers: index
                .capability_index
                .get(GENERAL_CAPABILITY)
                .map_or(0, BTreeSet::len),
            workers_by_tier,
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total_workers: usize,
    pub distinct_capabilities: usize,
    pub general_purpose_workers: usize,
    pub workers_by_tier: BTreeMap<ResourceTier, usize>,
}

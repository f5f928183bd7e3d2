//! Module registry
//!
//! Live set of usable adapters. Readers take an immutable snapshot; every
//! update builds a new snapshot and swaps it in under the lock, so an attempt
//! never observes a half-rebuilt registry.

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use biogate_core::{BackendId, Modality};

use crate::adapter::BackendAdapter;

/// One published adapter
#[derive(Clone)]
pub struct RegistryEntry {
    pub adapter: Arc<dyn BackendAdapter>,
    /// Loaded through the plugin registry rather than the static list
    pub plugin: bool,
}

impl RegistryEntry {
    pub fn native(adapter: Arc<dyn BackendAdapter>) -> Self {
        Self {
            adapter,
            plugin: false,
        }
    }

    pub fn plugin(adapter: Arc<dyn BackendAdapter>) -> Self {
        Self {
            adapter,
            plugin: true,
        }
    }
}

impl std::fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("backend", &self.adapter.backend_id())
            .field("plugin", &self.plugin)
            .finish()
    }
}

/// Immutable view of the registry at one point in time
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    entries: BTreeMap<BackendId, RegistryEntry>,
}

impl RegistrySnapshot {
    pub fn from_entries(entries: impl IntoIterator<Item = RegistryEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.adapter.backend_id(), entry))
                .collect(),
        }
    }

    /// Lowest-id entry for a concrete modality
    pub fn resolve(&self, modality: Modality) -> Option<&RegistryEntry> {
        // BTreeMap iterates in id order
        self.entries
            .iter()
            .find(|(id, _)| id.modality == modality)
            .map(|(_, entry)| entry)
    }

    pub fn get(&self, id: &BackendId) -> Option<&RegistryEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &BackendId) -> bool {
        self.entries.contains_key(id)
    }

    /// Whether a non-plugin adapter serves this modality
    pub fn has_native(&self, modality: Modality) -> bool {
        self.entries
            .iter()
            .any(|(id, entry)| id.modality == modality && !entry.plugin)
    }

    pub fn modalities(&self) -> BTreeSet<Modality> {
        self.entries.keys().map(|id| id.modality).collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &BackendId> {
        self.entries.keys()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lock-guarded holder of the current snapshot
pub struct ModuleRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    ready: AtomicBool,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot::default())),
            ready: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Whether the init pipeline has published at least once
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Clear-then-fill replacement; returns the previous snapshot
    pub fn replace(&self, snapshot: RegistrySnapshot) -> Arc<RegistrySnapshot> {
        let previous = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, Arc::new(snapshot))
        };
        self.ready.store(true, Ordering::Release);
        debug!("Registry replaced ({} entries before)", previous.len());
        previous
    }

    /// Publish additional entries without touching existing ones
    pub fn insert(&self, entries: Vec<RegistryEntry>) {
        let mut current = self.current.write();
        let mut next = (**current).clone();
        for entry in entries {
            next.entries.insert(entry.adapter.backend_id(), entry);
        }
        *current = Arc::new(next);
    }

    /// Drop the given identities; returns the removed entries
    pub fn remove(&self, ids: &[BackendId]) -> Vec<RegistryEntry> {
        let mut current = self.current.write();
        let mut next = (**current).clone();
        let removed = ids
            .iter()
            .filter_map(|id| next.entries.remove(id))
            .collect::<Vec<_>>();
        *current = Arc::new(next);
        removed
    }
}

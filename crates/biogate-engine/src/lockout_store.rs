//! Persistence for permanent lockout flags
//!
//! Keyed by modality. The engine only needs "is it locked" and "lock/unlock";
//! the JSON file store is what the CLI and hosts without their own key-value
//! store use.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

use biogate_core::Modality;

use crate::error::{EngineError, Result};

/// A persisted permanent lockout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutRecord {
    pub modality: Modality,
    pub locked_at: DateTime<Utc>,
}

/// Key-value boundary for lockout flags
pub trait LockoutStore: Send + Sync {
    fn is_locked(&self, modality: Modality) -> bool;

    /// Set or clear the flag. The in-memory view changes even if persisting fails.
    fn set_locked(&self, modality: Modality, locked: bool) -> Result<()>;

    fn records(&self) -> Vec<LockoutRecord>;
}

fn apply(records: &mut BTreeMap<Modality, LockoutRecord>, modality: Modality, locked: bool) -> bool {
    if locked {
        if records.contains_key(&modality) {
            return false;
        }
        records.insert(
            modality,
            LockoutRecord {
                modality,
                locked_at: Utc::now(),
            },
        );
        true
    } else {
        records.remove(&modality).is_some()
    }
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryLockoutStore {
    records: Mutex<BTreeMap<Modality, LockoutRecord>>,
}

impl MemoryLockoutStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockoutStore for MemoryLockoutStore {
    fn is_locked(&self, modality: Modality) -> bool {
        self.records.lock().contains_key(&modality)
    }

    fn set_locked(&self, modality: Modality, locked: bool) -> Result<()> {
        apply(&mut self.records.lock(), modality, locked);
        Ok(())
    }

    fn records(&self) -> Vec<LockoutRecord> {
        self.records.lock().values().cloned().collect()
    }
}

/// JSON file store, rewritten whole on every change
#[derive(Debug)]
pub struct FileLockoutStore {
    path: PathBuf,
    records: Mutex<BTreeMap<Modality, LockoutRecord>>,
}

impl FileLockoutStore {
    /// Open the store, reading existing records if the file exists
    pub fn open(path: PathBuf) -> Result<Self> {
        let records = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let list: Vec<LockoutRecord> = serde_json::from_str(&content)?;
            list.into_iter().map(|r| (r.modality, r)).collect()
        } else {
            BTreeMap::new()
        };
        debug!("Opened lockout store at {:?} ({} locked)", path, records.len());

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn save(&self, records: &BTreeMap<Modality, LockoutRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let list: Vec<&LockoutRecord> = records.values().collect();
        let content = serde_json::to_string_pretty(&list)?;
        std::fs::write(&self.path, content)
            .map_err(|e| EngineError::Store(format!("{}: {}", self.path.display(), e)))
    }
}

impl LockoutStore for FileLockoutStore {
    fn is_locked(&self, modality: Modality) -> bool {
        self.records.lock().contains_key(&modality)
    }

    fn set_locked(&self, modality: Modality, locked: bool) -> Result<()> {
        let mut records = self.records.lock();
        if apply(&mut records, modality, locked) {
            self.save(&records)?;
        }
        Ok(())
    }

    fn records(&self) -> Vec<LockoutRecord> {
        self.records.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryLockoutStore::new();
        assert!(!store.is_locked(Modality::Face));
        store.set_locked(Modality::Face, true).unwrap();
        assert!(store.is_locked(Modality::Face));
        assert!(!store.is_locked(Modality::Iris));
        store.set_locked(Modality::Face, false).unwrap();
        assert!(store.records().is_empty());
    }

    #[test]
    fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lockout.json");

        let store = FileLockoutStore::open(path.clone()).unwrap();
        store.set_locked(Modality::Fingerprint, true).unwrap();
        let first = store.records();
        drop(store);

        let reopened = FileLockoutStore::open(path.clone()).unwrap();
        assert!(reopened.is_locked(Modality::Fingerprint));
        // Relocking keeps the original timestamp
        reopened.set_locked(Modality::Fingerprint, true).unwrap();
        assert_eq!(reopened.records(), first);

        reopened.set_locked(Modality::Fingerprint, false).unwrap();
        drop(reopened);
        assert!(!FileLockoutStore::open(path).unwrap().is_locked(Modality::Fingerprint));
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockout.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileLockoutStore::open(path),
            Err(EngineError::Serialization(_))
        ));
    }
}

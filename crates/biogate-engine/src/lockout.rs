//! Lockout tracking
//!
//! Two independent sources decide whether a modality is locked:
//!
//! - transient lockout reported live by the adapter
//! - permanent lockout tracked here, set once a modality accumulates
//!   `threshold` consecutive escalating failures, cleared only by reset
//!
//! Permanent lockout wins: when it is set the adapter is not even asked.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use biogate_core::Modality;

use crate::adapter::BackendAdapter;
use crate::error::Result;
use crate::lockout_store::{LockoutRecord, LockoutStore};

/// Result of recording one escalating failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Counted, still below the threshold
    Counted { count: u32, threshold: u32 },
    /// Threshold reached; the modality is now permanently locked
    Locked,
}

/// Per-modality escalation counters plus the persisted permanent flags
pub struct LockoutTracker {
    store: Arc<dyn LockoutStore>,
    threshold: u32,
    counters: Mutex<HashMap<Modality, u32>>,
}

impl LockoutTracker {
    pub fn new(store: Arc<dyn LockoutStore>, threshold: u32) -> Self {
        Self {
            store,
            threshold: threshold.max(1),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Record a SENSOR_FAILED / AUTHENTICATION_FAILED that was not retried
    pub fn record_escalating_failure(&self, modality: Modality) -> Escalation {
        let count = {
            let mut counters = self.counters.lock();
            let count = counters.entry(modality).or_insert(0);
            *count += 1;
            *count
        };

        if count < self.threshold {
            return Escalation::Counted {
                count,
                threshold: self.threshold,
            };
        }

        warn!(
            "{} reached {} consecutive failures, locking permanently",
            modality, count
        );
        if let Err(e) = self.store.set_locked(modality, true) {
            error!("Failed to persist lockout for {}: {}", modality, e);
        }
        Escalation::Locked
    }

    /// A success ends the consecutive-failure run
    pub fn record_success(&self, modality: Modality) {
        self.counters.lock().remove(&modality);
    }

    pub fn failure_count(&self, modality: Modality) -> u32 {
        self.counters.lock().get(&modality).copied().unwrap_or(0)
    }

    pub fn is_permanently_locked(&self, modality: Modality) -> bool {
        self.store.is_locked(modality)
    }

    /// Combined view; permanent lockout short-circuits the adapter query
    pub async fn is_locked_out(&self, adapter: &dyn BackendAdapter) -> bool {
        if self.is_permanently_locked(adapter.modality()) {
            return true;
        }
        adapter.is_locked_out().await
    }

    /// Clear the permanent flag and the counter for one modality
    pub fn reset(&self, modality: Modality) -> Result<()> {
        self.counters.lock().remove(&modality);
        self.store.set_locked(modality, false)?;
        info!("Lockout reset for {}", modality);
        Ok(())
    }

    pub fn reset_all(&self) -> Result<()> {
        self.counters.lock().clear();
        for record in self.store.records() {
            self.store.set_locked(record.modality, false)?;
        }
        info!("All lockouts reset");
        Ok(())
    }

    pub fn locked(&self) -> Vec<LockoutRecord> {
        self.store.records()
    }

    /// Human-readable state for one modality
    pub fn describe(&self, modality: Modality) -> String {
        if self.is_permanently_locked(modality) {
            return format!("{} is locked until reset", modality);
        }
        let remaining = self.threshold.saturating_sub(self.failure_count(modality));
        format!("{} failures remaining before lockout", remaining)
    }
}

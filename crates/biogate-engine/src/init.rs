//! Init pipeline
//!
//! Probes every candidate backend on its own task, fans the results back in
//! through a completion counter and publishes the registry exactly once per
//! run. A constructor that fails, panics or hangs only removes its own
//! identity from the result.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use biogate_core::{BackendId, Modality};

use crate::adapter::AdapterFactory;
use crate::registry::{ModuleRegistry, RegistryEntry, RegistrySnapshot};

/// Published once per init run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyEvent {
    /// Identities in the new registry
    pub backends: Vec<BackendId>,
    /// Modalities in the new registry
    pub available: Vec<Modality>,
    /// Modalities absent from the previous registry
    pub newly_available: Vec<Modality>,
}

/// Global readiness callback
pub trait ReadyListener: Send + Sync {
    fn on_biometric_ready(&self, event: &ReadyEvent);
}

/// Registry lifecycle notifications
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Ready(ReadyEvent),
    PluginsLoaded(Vec<BackendId>),
    PluginsUnloaded(Vec<BackendId>),
}

#[derive(Clone)]
struct Candidate {
    factory: Arc<dyn AdapterFactory>,
    plugin: bool,
}

/// Concurrent probe-and-publish pipeline
pub struct InitPipeline {
    registry: Arc<ModuleRegistry>,
    candidates: Mutex<Vec<Candidate>>,
    running: AtomicBool,
    completed_runs: AtomicU64,
    probe_timeout: Duration,
    events: broadcast::Sender<RegistryEvent>,
}

impl InitPipeline {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        factories: Vec<Arc<dyn AdapterFactory>>,
        probe_timeout: Duration,
        events: broadcast::Sender<RegistryEvent>,
    ) -> Self {
        let candidates = factories
            .into_iter()
            .map(|factory| Candidate {
                factory,
                plugin: false,
            })
            .collect();

        Self {
            registry,
            candidates: Mutex::new(candidates),
            running: AtomicBool::new(false),
            completed_runs: AtomicU64::new(0),
            probe_timeout,
            events,
        }
    }

    /// Known identities, static first, then merged plugins
    pub fn known_backends(&self) -> Vec<BackendId> {
        self.candidates
            .lock()
            .iter()
            .map(|c| c.factory.backend_id())
            .collect()
    }

    /// Add plugin factories to the candidate list used by later runs
    pub fn merge_plugins(&self, factories: &[Arc<dyn AdapterFactory>]) {
        let mut candidates = self.candidates.lock();
        for factory in factories {
            let id = factory.backend_id();
            if candidates.iter().any(|c| c.factory.backend_id() == id) {
                continue;
            }
            candidates.push(Candidate {
                factory: Arc::clone(factory),
                plugin: true,
            });
        }
    }

    pub fn remove_plugins(&self, ids: &[BackendId]) {
        self.candidates
            .lock()
            .retain(|c| !(c.plugin && ids.contains(&c.factory.backend_id())));
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Wait until no run is in progress
    pub async fn idle(&self) {
        let mut events = self.events.subscribe();
        while self.is_running() {
            if let Err(broadcast::error::RecvError::Closed) = events.recv().await {
                return;
            }
        }
    }

    /// Number of runs that published a registry
    pub fn completed_runs(&self) -> u64 {
        self.completed_runs.load(Ordering::Acquire)
    }

    /// Start a run unless one is already in progress
    ///
    /// Returns whether a run was started. Callers must wait for the ready
    /// signal rather than the return of this call.
    pub fn init(
        self: &Arc<Self>,
        listener: Option<Arc<dyn ReadyListener>>,
        subset: Option<&[Modality]>,
    ) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Init already running, ignoring request");
            return false;
        }

        let candidates: Vec<Candidate> = {
            let all = self.candidates.lock();
            match subset {
                Some(filter) if !filter.is_empty() => all
                    .iter()
                    .filter(|c| {
                        let modality = c.factory.backend_id().modality;
                        filter.iter().any(|f| f.matches(modality))
                    })
                    .cloned()
                    .collect(),
                _ => all.clone(),
            }
        };

        info!("Initializing {} backend candidates", candidates.len());
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.run(candidates, listener).await });
        true
    }

    async fn run(self: Arc<Self>, candidates: Vec<Candidate>, listener: Option<Arc<dyn ReadyListener>>) {
        if candidates.is_empty() {
            self.publish(Vec::new(), listener);
            return;
        }

        let remaining = Arc::new(AtomicUsize::new(candidates.len()));
        let found = Arc::new(Mutex::new(Vec::new()));
        let listener = Arc::new(Mutex::new(listener));

        for candidate in candidates {
            let pipeline = Arc::clone(&self);
            let remaining = Arc::clone(&remaining);
            let found = Arc::clone(&found);
            let listener = Arc::clone(&listener);

            tokio::spawn(async move {
                let id = candidate.factory.backend_id();
                let mut probing = tokio::spawn(probe(candidate));
                match tokio::time::timeout(pipeline.probe_timeout, &mut probing).await {
                    Ok(Ok(Some(entry))) => found.lock().push(entry),
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => warn!("Probe for {} panicked, treating as absent: {}", id, e),
                    Err(_) => {
                        probing.abort();
                        warn!("Probe for {} timed out, treating as absent", id);
                    }
                }

                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let entries = std::mem::take(&mut *found.lock());
                    let listener = listener.lock().take();
                    pipeline.publish(entries, listener);
                }
            });
        }
    }

    fn publish(&self, mut entries: Vec<RegistryEntry>, listener: Option<Arc<dyn ReadyListener>>) {
        // A native backend takes priority over a plugin for the same modality
        let native: BTreeSet<Modality> = entries
            .iter()
            .filter(|e| !e.plugin)
            .map(|e| e.adapter.modality())
            .collect();
        entries.retain(|e| !e.plugin || !native.contains(&e.adapter.modality()));

        let snapshot = RegistrySnapshot::from_entries(entries);
        let backends: Vec<BackendId> = snapshot.ids().copied().collect();
        let available = snapshot.modalities();
        let previous = self.registry.replace(snapshot);
        let newly_available = available
            .difference(&previous.modalities())
            .copied()
            .collect();

        let event = ReadyEvent {
            backends,
            available: available.into_iter().collect(),
            newly_available,
        };

        self.completed_runs.fetch_add(1, Ordering::AcqRel);
        self.running.store(false, Ordering::Release);
        info!(
            "Registry ready: {} backends, modalities {:?}",
            event.backends.len(),
            event.available
        );

        if let Some(listener) = listener {
            listener.on_biometric_ready(&event);
        }
        let _ = self.events.send(RegistryEvent::Ready(event));
    }
}

/// Construct one adapter and keep it only if accessible and present
async fn probe(candidate: Candidate) -> Option<RegistryEntry> {
    let factory = Arc::clone(&candidate.factory);
    let id = factory.backend_id();

    let adapter = match tokio::task::spawn_blocking(move || factory.create()).await {
        Ok(Ok(adapter)) => adapter,
        Ok(Err(e)) => {
            warn!("Skipping {}: {}", id, e);
            return None;
        }
        Err(e) => {
            warn!("Constructor for {} panicked: {}", id, e);
            return None;
        }
    };

    if !adapter.is_manager_accessible().await {
        debug!("{} is not accessible", id);
        return None;
    }
    if !adapter.is_hardware_present().await {
        debug!("{} has no hardware", id);
        return None;
    }

    Some(RegistryEntry {
        adapter,
        plugin: candidate.plugin,
    })
}

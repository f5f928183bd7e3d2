//! Dynamic plugin registry
//!
//! Third-party adapter factories are found through a [`ProviderLookup`] and
//! published next to the native backends. A plugin never shadows a native
//! backend of the same modality. Loaded instances are kept in a bookkeeping
//! map so they can release their resources on unload.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use biogate_core::BackendId;

use crate::adapter::{AdapterFactory, BackendAdapter};
use crate::error::{EngineError, Result};
use crate::init::{InitPipeline, RegistryEvent};
use crate::registry::{ModuleRegistry, RegistryEntry};

/// Discovery mechanism for external adapter factories
pub trait ProviderLookup: Send + Sync {
    fn providers(&self) -> Result<Vec<Arc<dyn AdapterFactory>>>;
}

/// Explicit list of providers registered by the host
#[derive(Default)]
pub struct StaticProviders {
    factories: Mutex<Vec<Arc<dyn AdapterFactory>>>,
}

impl StaticProviders {
    pub fn new(factories: Vec<Arc<dyn AdapterFactory>>) -> Self {
        Self {
            factories: Mutex::new(factories),
        }
    }

    pub fn register(&self, factory: Arc<dyn AdapterFactory>) {
        self.factories.lock().push(factory);
    }
}

impl ProviderLookup for StaticProviders {
    fn providers(&self) -> Result<Vec<Arc<dyn AdapterFactory>>> {
        Ok(self.factories.lock().clone())
    }
}

/// Resets the busy flag however the operation ends
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PluginRegistry {
    lookup: Arc<dyn ProviderLookup>,
    registry: Arc<ModuleRegistry>,
    pipeline: Arc<InitPipeline>,
    events: broadcast::Sender<RegistryEvent>,
    busy: AtomicBool,
    loaded: Mutex<BTreeMap<BackendId, Arc<dyn BackendAdapter>>>,
}

impl PluginRegistry {
    pub fn new(
        lookup: Arc<dyn ProviderLookup>,
        registry: Arc<ModuleRegistry>,
        pipeline: Arc<InitPipeline>,
        events: broadcast::Sender<RegistryEvent>,
    ) -> Self {
        Self {
            lookup,
            registry,
            pipeline,
            events,
            busy: AtomicBool::new(false),
            loaded: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Identities currently loaded through discovery
    pub fn loaded(&self) -> Vec<BackendId> {
        self.loaded.lock().keys().copied().collect()
    }

    /// Discover, construct and publish plugin adapters
    ///
    /// Returns `None` when another load or unload is in progress.
    pub async fn load_custom_modules(&self) -> Result<Option<Vec<BackendId>>> {
        let Some(_guard) = BusyGuard::acquire(&self.busy) else {
            debug!("Plugin registry busy, ignoring load");
            return Ok(None);
        };

        let factories = self
            .lookup
            .providers()
            .map_err(|e| EngineError::Plugin(format!("provider lookup failed: {}", e)))?;
        let snapshot = self.registry.snapshot();
        let mut accepted: Vec<Arc<dyn AdapterFactory>> = Vec::new();
        let mut entries = Vec::new();

        for factory in factories {
            let id = factory.backend_id();
            if snapshot.has_native(id.modality) {
                info!("Skipping plugin {}: {} is natively available", id, id.modality);
                continue;
            }
            if self.loaded.lock().contains_key(&id) {
                continue;
            }

            let Some(adapter) = construct(Arc::clone(&factory)).await else {
                continue;
            };
            if !(adapter.is_manager_accessible().await && adapter.is_hardware_present().await) {
                debug!("Plugin {} is not usable on this device", id);
                adapter.release();
                continue;
            }

            accepted.push(factory);
            entries.push(RegistryEntry::plugin(adapter));
        }

        // Runs started from here on include the plugins; an earlier run would
        // publish without them, so let it finish first
        self.pipeline.merge_plugins(&accepted);
        self.pipeline.idle().await;

        let current = self.registry.snapshot();
        let mut ids = Vec::new();
        let mut publish = Vec::new();
        for entry in entries {
            let id = entry.adapter.backend_id();
            if current.has_native(id.modality) {
                info!("Dropping plugin {}: {} became natively available", id, id.modality);
                entry.adapter.release();
                continue;
            }
            ids.push(id);
            if current.contains(&id) {
                debug!("Plugin {} already published by a re-init", id);
                entry.adapter.release();
                continue;
            }
            self.loaded.lock().insert(id, Arc::clone(&entry.adapter));
            publish.push(entry);
        }
        self.registry.insert(publish);

        info!("Loaded {} plugin adapters", ids.len());
        let _ = self.events.send(RegistryEvent::PluginsLoaded(ids.clone()));
        Ok(Some(ids))
    }

    /// Remove every plugin adapter and let each instance release itself
    ///
    /// Returns `None` when another load or unload is in progress.
    pub fn unload_custom_modules(&self) -> Option<Vec<BackendId>> {
        let Some(_guard) = BusyGuard::acquire(&self.busy) else {
            debug!("Plugin registry busy, ignoring unload");
            return None;
        };

        let instances: Vec<(BackendId, Arc<dyn BackendAdapter>)> =
            std::mem::take(&mut *self.loaded.lock()).into_iter().collect();
        let ids: Vec<BackendId> = instances.iter().map(|(id, _)| *id).collect();

        let removed = self.registry.remove(&ids);
        self.pipeline.remove_plugins(&ids);

        for (_, adapter) in &instances {
            adapter.release();
        }
        // A re-init may have published fresh instances of the same plugins
        for entry in removed {
            let known = instances
                .iter()
                .any(|(_, adapter)| same_instance(adapter, &entry.adapter));
            if !known {
                entry.adapter.release();
            }
        }

        info!("Unloaded {} plugin adapters", ids.len());
        let _ = self.events.send(RegistryEvent::PluginsUnloaded(ids.clone()));
        Some(ids)
    }
}

async fn construct(factory: Arc<dyn AdapterFactory>) -> Option<Arc<dyn BackendAdapter>> {
    let id = factory.backend_id();
    match tokio::task::spawn_blocking(move || factory.create()).await {
        Ok(Ok(adapter)) => Some(adapter),
        Ok(Err(e)) => {
            warn!("Plugin {} failed to construct: {}", id, e);
            None
        }
        Err(e) => {
            warn!("Plugin {} constructor panicked: {}", id, e);
            None
        }
    }
}

fn same_instance(a: &Arc<dyn BackendAdapter>, b: &Arc<dyn BackendAdapter>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

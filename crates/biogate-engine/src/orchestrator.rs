//! Biogate facade
//!
//! Owns the registry, the init pipeline, the plugin registry, the lockout
//! tracker and the dispatch core, and wires them to each other.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use biogate_core::{BackendId, Modality};

use crate::adapter::{AdapterFactory, BackendAdapter};
use crate::config::EngineConfig;
use crate::dispatch::{AuthRequest, DispatchCore, DispatchOutcome};
use crate::error::Result;
use crate::init::{InitPipeline, ReadyListener, RegistryEvent};
use crate::listener::AuthListener;
use crate::lockout::LockoutTracker;
use crate::lockout_store::{FileLockoutStore, LockoutRecord, LockoutStore};
use crate::plugins::{PluginRegistry, ProviderLookup, StaticProviders};
use crate::registry::{ModuleRegistry, RegistrySnapshot};
use crate::timing::{AnimationTiming, DebounceTiming};

const EVENT_CAPACITY: usize = 64;

/// Builder for [`Biogate`]
pub struct BiogateBuilder {
    config: EngineConfig,
    factories: Vec<Arc<dyn AdapterFactory>>,
    lookup: Option<Arc<dyn ProviderLookup>>,
    store: Option<Arc<dyn LockoutStore>>,
    timing: Option<Arc<dyn DebounceTiming>>,
}

impl BiogateBuilder {
    /// Add a native backend to the static candidate list
    pub fn backend(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn backends(mut self, factories: impl IntoIterator<Item = Arc<dyn AdapterFactory>>) -> Self {
        self.factories.extend(factories);
        self
    }

    pub fn plugin_lookup(mut self, lookup: Arc<dyn ProviderLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn lockout_store(mut self, store: Arc<dyn LockoutStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn timing(mut self, timing: Arc<dyn DebounceTiming>) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Validate the configuration and assemble the orchestrator
    ///
    /// Without an explicit store the lockout flags go to the configured file.
    pub fn build(self) -> Result<Biogate> {
        self.config.validate()?;

        let store: Arc<dyn LockoutStore> = match self.store {
            Some(store) => store,
            None => {
                self.config.ensure_directories()?;
                Arc::new(FileLockoutStore::open(self.config.lockout_store_path.clone())?)
            }
        };
        let timing: Arc<dyn DebounceTiming> = match self.timing {
            Some(timing) => timing,
            None => Arc::new(AnimationTiming::new(self.config.animation_base())),
        };
        let lookup: Arc<dyn ProviderLookup> = match self.lookup {
            Some(lookup) => lookup,
            None => Arc::new(StaticProviders::default()),
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new(ModuleRegistry::new());
        let pipeline = Arc::new(InitPipeline::new(
            Arc::clone(&registry),
            self.factories,
            self.config.probe_timeout(),
            events.clone(),
        ));
        let tracker = Arc::new(LockoutTracker::new(store, self.config.lockout_threshold));
        let dispatch = Arc::new(DispatchCore::new(
            Arc::clone(&registry),
            Arc::clone(&pipeline),
            Arc::clone(&tracker),
            timing,
            &self.config,
        ));
        let plugins = PluginRegistry::new(
            lookup,
            Arc::clone(&registry),
            Arc::clone(&pipeline),
            events.clone(),
        );

        Ok(Biogate {
            config: self.config,
            registry,
            pipeline,
            plugins,
            tracker,
            dispatch,
            events,
        })
    }
}

/// Backend orchestrator
pub struct Biogate {
    config: EngineConfig,
    registry: Arc<ModuleRegistry>,
    pipeline: Arc<InitPipeline>,
    plugins: PluginRegistry,
    tracker: Arc<LockoutTracker>,
    dispatch: Arc<DispatchCore>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Biogate {
    pub fn builder(config: EngineConfig) -> BiogateBuilder {
        BiogateBuilder {
            config,
            factories: Vec::new(),
            lookup: None,
            store: None,
            timing: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start an init run; a call while one is running is a no-op
    pub fn init(&self, listener: Option<Arc<dyn ReadyListener>>, subset: Option<&[Modality]>) -> bool {
        self.pipeline.init(listener, subset)
    }

    /// Wait until the first registry publication, bounded by the configured wait
    pub async fn wait_until_ready(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.ready_wait_timeout();
        while !self.registry.is_ready() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.ready_poll_interval()).await;
        }
        true
    }

    /// Wait for the next init run to publish, or for `timeout`
    pub async fn wait_for_init(&self, runs_before: u64, timeout: Duration) -> bool {
        let wait = async {
            while self.pipeline.completed_runs() <= runs_before {
                tokio::time::sleep(self.config.ready_poll_interval()).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub fn completed_init_runs(&self) -> u64 {
        self.pipeline.completed_runs()
    }

    pub fn authenticate(&self, request: AuthRequest, listener: Arc<dyn AuthListener>) -> DispatchOutcome {
        self.dispatch.authenticate(request, listener)
    }

    pub fn cancel_authentication(&self) -> bool {
        self.dispatch.cancel_authentication()
    }

    pub fn is_in_flight(&self) -> bool {
        self.dispatch.is_in_flight()
    }

    pub async fn load_custom_modules(&self) -> Result<Option<Vec<BackendId>>> {
        self.plugins.load_custom_modules().await
    }

    pub fn unload_custom_modules(&self) -> Option<Vec<BackendId>> {
        self.plugins.unload_custom_modules()
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.registry.snapshot()
    }

    pub fn available_modalities(&self) -> Vec<Modality> {
        self.registry.snapshot().modalities().into_iter().collect()
    }

    /// Lowest-id adapter per matching modality
    fn candidates(&self, modality: Modality) -> Vec<Arc<dyn BackendAdapter>> {
        let snapshot = self.registry.snapshot();
        snapshot
            .modalities()
            .into_iter()
            .filter(|m| modality.matches(*m))
            .filter_map(|m| snapshot.resolve(m).map(|e| Arc::clone(&e.adapter)))
            .collect()
    }

    pub async fn is_hardware_detected(&self, modality: Modality) -> bool {
        for adapter in self.candidates(modality) {
            if adapter.is_hardware_present().await {
                return true;
            }
        }
        false
    }

    pub async fn has_enrolled(&self, modality: Modality) -> bool {
        for adapter in self.candidates(modality) {
            if adapter.has_enrolled().await {
                return true;
            }
        }
        false
    }

    /// Permanent lockout wins over whatever the adapter reports
    pub async fn is_locked_out(&self, modality: Modality) -> bool {
        if !modality.is_any() && self.tracker.is_permanently_locked(modality) {
            return true;
        }
        for adapter in self.candidates(modality) {
            if self.tracker.is_locked_out(adapter.as_ref()).await {
                return true;
            }
        }
        false
    }

    pub fn lockout_records(&self) -> Vec<LockoutRecord> {
        self.tracker.locked()
    }

    pub fn describe_lockout(&self, modality: Modality) -> String {
        self.tracker.describe(modality)
    }

    pub fn reset_lockout(&self, modality: Modality) -> Result<()> {
        self.tracker.reset(modality)
    }

    pub fn reset_all_lockouts(&self) -> Result<()> {
        self.tracker.reset_all()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}

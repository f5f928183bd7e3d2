//! Dispatch core
//!
//! Resolves one adapter per requested modality, starts them concurrently and
//! arbitrates: the first success wins, a terminal failure is delivered once
//! the last started adapter gives up, and anything reported for a session
//! that is no longer current is discarded.
//!
//! Only one session exists system-wide. The single-flight guard is an atomic
//! compare-and-set; every session also carries a generation so late reports
//! from a previous session can never be attributed to the next one.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use biogate_core::{BackendId, CryptoPurpose, FailureReason, Modality, ViewTarget};

use crate::adapter::BackendAdapter;
use crate::classifier::{RestartPredicate, RetryStateMachine};
use crate::config::EngineConfig;
use crate::driver::{AttemptDriver, Report, SessionReporter};
use crate::init::InitPipeline;
use crate::listener::{AuthEvent, AuthListener, DeliveryQueue, FailureReport};
use crate::lockout::LockoutTracker;
use crate::registry::{ModuleRegistry, RegistryEntry, RegistrySnapshot};
use crate::timing::DebounceTiming;

/// Per-attempt options
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    /// Plugin adapters skip the enrollment check, for enrollment flows
    pub registration_mode: bool,
    /// Failures to retry silently on top of TIMEOUT
    pub restart_predicate: RestartPredicate,
}

/// One authentication request
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub purpose: CryptoPurpose,
    pub view: Option<ViewTarget>,
    pub modalities: Vec<Modality>,
    pub options: AuthOptions,
}

impl AuthRequest {
    pub fn new(purpose: CryptoPurpose, modalities: impl IntoIterator<Item = Modality>) -> Self {
        Self {
            purpose,
            view: None,
            modalities: modalities.into_iter().collect(),
            options: AuthOptions::default(),
        }
    }

    pub fn with_view(mut self, view: ViewTarget) -> Self {
        self.view = Some(view);
        self
    }

    pub fn registration_mode(mut self) -> Self {
        self.options.registration_mode = true;
        self
    }

    pub fn with_restart_predicate(mut self, predicate: RestartPredicate) -> Self {
        self.options.restart_predicate = predicate;
        self
    }

    /// Modality used to tag outcomes not attributable to one adapter
    fn result_modality(&self) -> Modality {
        match self.modalities.as_slice() {
            [single] => *single,
            _ => Modality::Any,
        }
    }
}

/// What `authenticate` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Started(Uuid),
    /// Waiting for the first registry publication
    Queued,
    /// Empty request or another attempt in flight
    Ignored,
}

struct ActiveSession {
    id: Uuid,
    generation: u64,
    modality: Modality,
    listener: Weak<dyn AuthListener>,
    /// tag -> started adapter
    started: BTreeMap<u32, (Modality, Arc<dyn BackendAdapter>)>,
    outstanding: usize,
    ended: watch::Sender<bool>,
}

pub struct DispatchCore {
    registry: Arc<ModuleRegistry>,
    pipeline: Arc<InitPipeline>,
    tracker: Arc<LockoutTracker>,
    timing: Arc<dyn DebounceTiming>,
    ready_wait: Duration,
    ready_poll: Duration,
    in_flight: AtomicBool,
    generation: AtomicU64,
    current: Mutex<Option<ActiveSession>>,
    queue: DeliveryQueue,
}

impl DispatchCore {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        pipeline: Arc<InitPipeline>,
        tracker: Arc<LockoutTracker>,
        timing: Arc<dyn DebounceTiming>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            pipeline,
            tracker,
            timing,
            ready_wait: config.ready_wait_timeout(),
            ready_poll: config.ready_poll_interval(),
            in_flight: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
            queue: DeliveryQueue::new(),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn active_session(&self) -> Option<Uuid> {
        self.current.lock().as_ref().map(|s| s.id)
    }

    /// Start an attempt; results arrive through `listener`
    ///
    /// Only a weak reference to the listener is kept.
    pub fn authenticate(
        self: &Arc<Self>,
        request: AuthRequest,
        listener: Arc<dyn AuthListener>,
    ) -> DispatchOutcome {
        if request.modalities.is_empty() {
            debug!("Ignoring request without modalities");
            return DispatchOutcome::Ignored;
        }

        if !self.registry.is_ready() {
            self.queue_until_ready(request, Arc::downgrade(&listener));
            return DispatchOutcome::Queued;
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Attempt already in flight, ignoring request");
            return DispatchOutcome::Ignored;
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let id = Uuid::new_v4();
        let (ended, _) = watch::channel(false);
        *self.current.lock() = Some(ActiveSession {
            id,
            generation,
            modality: request.result_modality(),
            listener: Arc::downgrade(&listener),
            started: BTreeMap::new(),
            outstanding: 0,
            ended,
        });
        info!(session = %id, "Authentication requested for {:?}", request.modalities);

        let core = Arc::clone(self);
        tokio::spawn(async move { core.start(generation, request).await });
        DispatchOutcome::Started(id)
    }

    /// Globally cancel the current attempt
    ///
    /// Returns whether a session was active. The guard is free when this
    /// returns; a re-init of the previously available modalities follows.
    pub fn cancel_authentication(&self) -> bool {
        let session = self.current.lock().take();
        let Some(session) = session else {
            debug!("No attempt to cancel");
            return false;
        };

        self.generation.fetch_add(1, Ordering::AcqRel);
        self.close(&session);
        for (_, adapter) in session.started.values() {
            adapter.stop();
        }
        self.queue.push(
            session.id,
            &session.listener,
            AuthEvent::Canceled {
                reason: None,
                modality: session.modality,
            },
        );
        info!(
            session = %session.id,
            "Authentication canceled, {} adapters stopped",
            session.started.len()
        );

        let previous: Vec<Modality> = self.registry.snapshot().modalities().into_iter().collect();
        if !previous.is_empty() {
            self.pipeline.init(None, Some(&previous));
        }
        true
    }

    async fn start(self: Arc<Self>, generation: u64, request: AuthRequest) {
        let snapshot = self.registry.snapshot();
        let mut selected: Vec<RegistryEntry> = Vec::new();
        let mut locked = false;
        let mut not_enrolled = false;

        for modality in expand(&request.modalities, &snapshot) {
            if self.tracker.is_permanently_locked(modality) {
                debug!("{} is permanently locked", modality);
                locked = true;
                continue;
            }
            let Some(entry) = snapshot.resolve(modality) else {
                continue;
            };
            if entry.adapter.is_locked_out().await {
                debug!("{} reports a transient lockout", entry.adapter.backend_id());
                locked = true;
                continue;
            }
            let bypass = request.options.registration_mode && entry.plugin;
            if !bypass && !entry.adapter.has_enrolled().await {
                debug!("{} has nothing enrolled", entry.adapter.backend_id());
                not_enrolled = true;
                continue;
            }
            selected.push(entry.clone());
        }

        if selected.is_empty() {
            let reason = if locked {
                FailureReason::LockedOut
            } else if not_enrolled {
                FailureReason::NoBiometricsRegistered
            } else {
                FailureReason::NoHardware
            };
            self.fail_unstarted(generation, reason, request.result_modality());
            return;
        }

        let ended = {
            let mut current = self.current.lock();
            let Some(session) = current.as_mut().filter(|s| s.generation == generation) else {
                debug!("Session ended during resolution, not starting adapters");
                return;
            };
            for entry in &selected {
                session.started.insert(
                    entry.adapter.tag(),
                    (entry.adapter.modality(), Arc::clone(&entry.adapter)),
                );
            }
            session.outstanding = selected.len();
            session.ended.subscribe()
        };

        let reporter: Arc<dyn SessionReporter> = self.clone();
        for entry in selected {
            let modality = entry.adapter.modality();
            info!("Starting {}", entry.adapter.backend_id());
            let machine = RetryStateMachine::new(
                modality,
                self.timing.debounce_window(),
                request.options.restart_predicate.clone(),
                Arc::clone(&self.tracker),
            );
            AttemptDriver::new(
                entry.adapter,
                generation,
                request.purpose.clone(),
                request.view.clone(),
                machine,
                Arc::clone(&self.timing),
                Arc::clone(&reporter),
                ended.clone(),
            )
            .spawn();
        }
    }

    /// Resolution produced nothing to start
    fn fail_unstarted(&self, generation: u64, reason: FailureReason, modality: Modality) {
        let mut current = self.current.lock();
        if !current.as_ref().is_some_and(|s| s.generation == generation) {
            return;
        }
        if let Some(session) = current.take() {
            self.close(&session);
            info!(session = %session.id, "Nothing to start: {}", reason);
            self.queue.push(
                session.id,
                &session.listener,
                AuthEvent::Failure(FailureReport {
                    reason,
                    modality,
                    terminal: true,
                }),
            );
        }
    }

    fn queue_until_ready(self: &Arc<Self>, request: AuthRequest, listener: Weak<dyn AuthListener>) {
        debug!("Registry not ready, queuing request");
        let core = Arc::clone(self);

        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + core.ready_wait;
            while !core.registry.is_ready() {
                if tokio::time::Instant::now() >= deadline {
                    warn!("Registry not ready after {:?}", core.ready_wait);
                    core.queue.push(
                        Uuid::new_v4(),
                        &listener,
                        AuthEvent::Failure(FailureReport {
                            reason: FailureReason::NotInitialized,
                            modality: request.result_modality(),
                            terminal: true,
                        }),
                    );
                    return;
                }
                tokio::time::sleep(core.ready_poll).await;
            }

            match listener.upgrade() {
                Some(listener) => {
                    core.authenticate(request, listener);
                }
                None => debug!("Caller gone before the registry was ready"),
            }
        });
    }

    /// Release the guard and tell the drivers to stop listening
    fn close(&self, session: &ActiveSession) {
        self.in_flight.store(false, Ordering::Release);
        session.ended.send_replace(true);
    }
}

impl SessionReporter for DispatchCore {
    fn is_current(&self, generation: u64) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    fn report(&self, generation: u64, backend: BackendId, report: Report) {
        let mut current = self.current.lock();
        let Some(session) = current.as_mut().filter(|s| s.generation == generation) else {
            debug!("Discarding {:?} from {} for an ended session", report, backend);
            return;
        };
        let modality = session
            .started
            .get(&backend.id)
            .map(|(modality, _)| *modality)
            .unwrap_or(backend.modality);
        let id = session.id;
        let listener = session.listener.clone();

        let user_cancel = matches!(report, Report::Canceled(_));
        let (event, ends) = match report {
            Report::Help(message) => (AuthEvent::Help { modality, message }, false),
            Report::Failure { reason, done } => {
                if done {
                    session.outstanding = session.outstanding.saturating_sub(1);
                }
                let terminal = done && session.outstanding == 0;
                (
                    AuthEvent::Failure(FailureReport {
                        reason,
                        modality,
                        terminal,
                    }),
                    terminal,
                )
            }
            Report::Success(crypto) => (AuthEvent::Success { modality, crypto }, true),
            Report::Canceled(origin) => {
                debug!("{} canceled by {:?}", backend, origin);
                (
                    AuthEvent::Canceled {
                        reason: None,
                        modality,
                    },
                    true,
                )
            }
        };

        let ended = if ends { current.take() } else { None };
        if let Some(session) = &ended {
            self.close(session);
            info!(session = %id, "Session resolved by {}: {:?}", backend, event);
        }
        self.queue.push(id, &listener, event);
        drop(current);

        // An explicit cancel ends the attempt on every adapter
        if let Some(session) = ended.filter(|_| user_cancel) {
            for (tag, (_, adapter)) in &session.started {
                if *tag != backend.id {
                    adapter.stop();
                }
            }
        }
    }
}

/// Concrete modalities for a request; `Any` means everything registered
fn expand(requested: &[Modality], snapshot: &RegistrySnapshot) -> BTreeSet<Modality> {
    let mut out = BTreeSet::new();
    for modality in requested {
        if modality.is_any() {
            out.extend(snapshot.modalities());
        } else {
            out.insert(*modality);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterFactory;
    use crate::init::RegistryEvent;
    use crate::listener::RecordingListener;
    use crate::lockout_store::MemoryLockoutStore;
    use crate::sim::{SimBackendSpec, SimEvent, SimStep, SimulatedFactory};
    use crate::timing::FixedTiming;
    use biogate_core::failure::native;
    use tokio::sync::broadcast;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        core: Arc<DispatchCore>,
        pipeline: Arc<InitPipeline>,
        registry: Arc<ModuleRegistry>,
        factories: Vec<Arc<SimulatedFactory>>,
    }

    impl Harness {
        fn new(specs: Vec<SimBackendSpec>) -> Self {
            let factories: Vec<Arc<SimulatedFactory>> = specs
                .into_iter()
                .map(|spec| Arc::new(SimulatedFactory::new(spec)))
                .collect();
            let registry = Arc::new(ModuleRegistry::new());
            let (events, _) = broadcast::channel::<RegistryEvent>(16);
            let pipeline = Arc::new(InitPipeline::new(
                Arc::clone(&registry),
                factories
                    .iter()
                    .map(|f| Arc::clone(f) as Arc<dyn AdapterFactory>)
                    .collect(),
                Duration::from_secs(1),
                events,
            ));
            let tracker = Arc::new(LockoutTracker::new(Arc::new(MemoryLockoutStore::new()), 2));
            let config = EngineConfig {
                ready_wait_timeout_ms: 150,
                ready_poll_interval_ms: 10,
                ..EngineConfig::default()
            };
            let core = Arc::new(DispatchCore::new(
                Arc::clone(&registry),
                Arc::clone(&pipeline),
                tracker,
                Arc::new(FixedTiming(Duration::from_millis(20))),
                &config,
            ));
            Self {
                core,
                pipeline,
                registry,
                factories,
            }
        }

        async fn ready(specs: Vec<SimBackendSpec>) -> Self {
            let harness = Self::new(specs);
            harness.pipeline.init(None, None);
            for _ in 0..200 {
                if harness.registry.is_ready() {
                    return harness;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("registry never became ready");
        }
    }

    fn face(id: u32) -> SimBackendSpec {
        SimBackendSpec::new(BackendId::new(id, Modality::Face))
    }

    fn success_after(ms: u64) -> Vec<SimStep> {
        vec![SimStep::after(ms, SimEvent::Success { token: None })]
    }

    #[tokio::test]
    async fn test_empty_request_is_ignored() {
        let h = Harness::ready(vec![face(1)]).await;
        let listener = RecordingListener::new();
        let request = AuthRequest::new(CryptoPurpose::encrypt(), Vec::new());
        assert_eq!(h.core.authenticate(request, listener), DispatchOutcome::Ignored);
        assert!(!h.core.is_in_flight());
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let h = Harness::ready(vec![
            face(1).ignore_stop().with_script(success_after(40)),
            SimBackendSpec::new(BackendId::new(2, Modality::Fingerprint))
                .ignore_stop()
                .with_script(success_after(80)),
        ])
        .await;
        let listener = RecordingListener::new();
        let request = AuthRequest::new(
            CryptoPurpose::encrypt(),
            [Modality::Face, Modality::Fingerprint],
        );
        assert!(matches!(
            h.core.authenticate(request, listener.clone()),
            DispatchOutcome::Started(_)
        ));

        let terminal = listener.wait_for_terminal(WAIT).await;
        assert!(matches!(
            terminal,
            Some(AuthEvent::Success {
                modality: Modality::Face,
                ..
            })
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(listener.terminal_events().len(), 1);
        assert!(!h.core.is_in_flight());
    }

    #[tokio::test]
    async fn test_second_request_while_in_flight_is_ignored() {
        let h = Harness::ready(vec![face(1).with_script(success_after(60))]).await;
        let first = RecordingListener::new();
        let second = RecordingListener::new();

        h.core
            .authenticate(AuthRequest::new(CryptoPurpose::encrypt(), [Modality::Face]), first.clone());
        assert_eq!(
            h.core.authenticate(
                AuthRequest::new(CryptoPurpose::encrypt(), [Modality::Face]),
                second.clone()
            ),
            DispatchOutcome::Ignored
        );

        assert!(first.wait_for_terminal(WAIT).await.is_some());
        assert!(second.events().is_empty());
        assert_eq!(h.factories[0].last_instance().unwrap().authenticate_calls(), 1);
    }

    #[tokio::test]
    async fn test_not_enrolled_is_distinct_from_no_hardware() {
        let h = Harness::ready(vec![face(1).enrolled(false)]).await;

        let listener = RecordingListener::new();
        h.core
            .authenticate(AuthRequest::new(CryptoPurpose::encrypt(), [Modality::Face]), listener.clone());
        let terminal = listener.wait_for_terminal(WAIT).await;
        assert!(matches!(
            terminal,
            Some(AuthEvent::Failure(FailureReport {
                reason: FailureReason::NoBiometricsRegistered,
                terminal: true,
                ..
            }))
        ));

        let listener = RecordingListener::new();
        h.core
            .authenticate(AuthRequest::new(CryptoPurpose::encrypt(), [Modality::Iris]), listener.clone());
        let terminal = listener.wait_for_terminal(WAIT).await;
        assert!(matches!(
            terminal,
            Some(AuthEvent::Failure(FailureReport {
                reason: FailureReason::NoHardware,
                modality: Modality::Iris,
                ..
            }))
        ));
        assert_eq!(h.factories[0].last_instance().unwrap().authenticate_calls(), 0);
    }

    #[tokio::test]
    async fn test_registration_mode_bypasses_enrollment_for_plugins() {
        let h = Harness::new(Vec::new());
        let plugin = Arc::new(SimulatedFactory::new(
            face(100).plugin().enrolled(false).with_script(success_after(40)),
        ));
        h.pipeline.merge_plugins(&[plugin.clone() as Arc<dyn AdapterFactory>]);
        h.pipeline.init(None, None);
        while !h.registry.is_ready() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let listener = RecordingListener::new();
        let request =
            AuthRequest::new(CryptoPurpose::encrypt(), [Modality::Face]).registration_mode();
        h.core.authenticate(request, listener.clone());
        assert!(matches!(
            listener.wait_for_terminal(WAIT).await,
            Some(AuthEvent::Success { .. })
        ));
    }

    #[tokio::test]
    async fn test_queued_request_runs_once_ready() {
        let h = Harness::new(vec![face(1).with_script(success_after(40))]);
        let listener = RecordingListener::new();
        assert_eq!(
            h.core.authenticate(
                AuthRequest::new(CryptoPurpose::encrypt(), [Modality::Face]),
                listener.clone()
            ),
            DispatchOutcome::Queued
        );

        h.pipeline.init(None, None);
        assert!(matches!(
            listener.wait_for_terminal(WAIT).await,
            Some(AuthEvent::Success { .. })
        ));
    }

    #[tokio::test]
    async fn test_queued_request_expires_as_not_initialized() {
        let h = Harness::new(vec![face(1)]);
        let listener = RecordingListener::new();
        h.core.authenticate(
            AuthRequest::new(CryptoPurpose::encrypt(), [Modality::Face]),
            listener.clone(),
        );

        assert!(matches!(
            listener.wait_for_terminal(WAIT).await,
            Some(AuthEvent::Failure(FailureReport {
                reason: FailureReason::NotInitialized,
                ..
            }))
        ));
        assert!(!h.core.is_in_flight());
    }

    #[tokio::test]
    async fn test_terminal_failure_waits_for_last_adapter() {
        let h = Harness::ready(vec![
            face(1).with_script(vec![SimStep::after(
                40,
                SimEvent::Native {
                    code: native::HW_UNAVAILABLE,
                },
            )]),
            SimBackendSpec::new(BackendId::new(2, Modality::Iris)).with_script(vec![SimStep::after(
                100,
                SimEvent::Native {
                    code: native::HW_NOT_PRESENT,
                },
            )]),
        ])
        .await;
        let listener = RecordingListener::new();
        h.core.authenticate(
            AuthRequest::new(CryptoPurpose::encrypt(), [Modality::Face, Modality::Iris]),
            listener.clone(),
        );

        let terminal = listener.wait_for_terminal(WAIT).await;
        assert!(matches!(
            terminal,
            Some(AuthEvent::Failure(FailureReport {
                reason: FailureReason::NoHardware,
                modality: Modality::Iris,
                terminal: true,
            }))
        ));
        let events = listener.events();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            AuthEvent::Failure(FailureReport {
                reason: FailureReason::HardwareUnavailable,
                modality: Modality::Face,
                terminal: false,
            })
        );
    }

    #[tokio::test]
    async fn test_user_cancel_stops_siblings() {
        let h = Harness::ready(vec![
            face(1).with_script(vec![SimStep::after(
                40,
                SimEvent::Native {
                    code: native::USER_CANCELED,
                },
            )]),
            SimBackendSpec::new(BackendId::new(2, Modality::Iris)).with_script(success_after(200)),
        ])
        .await;
        let listener = RecordingListener::new();
        h.core.authenticate(
            AuthRequest::new(CryptoPurpose::encrypt(), [Modality::Face, Modality::Iris]),
            listener.clone(),
        );

        assert!(matches!(
            listener.wait_for_terminal(WAIT).await,
            Some(AuthEvent::Canceled { reason: None, .. })
        ));
        let iris = h.factories[1].last_instance().unwrap();
        assert_eq!(iris.stop_calls(), 1);
        assert!(!h.core.is_in_flight());
    }

    #[tokio::test]
    async fn test_cancel_releases_guard_and_discards_late_results() {
        let h = Harness::ready(vec![
            face(1).ignore_stop().with_script(success_after(80)),
            SimBackendSpec::new(BackendId::new(2, Modality::Iris))
                .ignore_stop()
                .with_script(success_after(80)),
        ])
        .await;
        let face_adapter = h.factories[0].last_instance().unwrap();
        let iris_adapter = h.factories[1].last_instance().unwrap();
        let listener = RecordingListener::new();
        h.core.authenticate(
            AuthRequest::new(CryptoPurpose::encrypt(), [Modality::Face, Modality::Iris]),
            listener.clone(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(h.core.cancel_authentication());
        assert!(!h.core.is_in_flight());
        assert!(h.core.active_session().is_none());
        assert_eq!(face_adapter.stop_calls(), 1);
        assert_eq!(iris_adapter.stop_calls(), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let events = listener.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], AuthEvent::Canceled { reason: None, .. }));
        assert!(!h.core.cancel_authentication());
    }

    #[tokio::test]
    async fn test_dropped_listener_does_not_pin_session() {
        let h = Harness::ready(vec![face(1).with_script(success_after(40))]).await;
        let listener = RecordingListener::new();
        let weak = Arc::downgrade(&listener);
        h.core
            .authenticate(AuthRequest::new(CryptoPurpose::encrypt(), [Modality::Face]), listener);

        assert!(weak.upgrade().is_none());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!h.core.is_in_flight());
    }
}

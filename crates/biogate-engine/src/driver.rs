//! Per-adapter attempt driver
//!
//! One task per started adapter. It owns the adapter's event channel and the
//! retry state machine, re-invokes the adapter on retry and reports the
//! classified outcome to the session. It stops listening as soon as the
//! session ends, so nothing it hears afterwards can reach the caller.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use biogate_core::{BackendId, CancelOrigin, CryptoObject, CryptoPurpose, FailureReason, ViewTarget};

use crate::adapter::{AdapterSink, AttemptContext, BackendAdapter, CancelHandle, SinkEvent};
use crate::classifier::{RetryStateMachine, Step};
use crate::timing::DebounceTiming;

/// Classified outcome sent from a driver to its session
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Report {
    Help(String),
    Success(Option<CryptoObject>),
    /// `done` is set when this adapter will not report again
    Failure { reason: FailureReason, done: bool },
    Canceled(CancelOrigin),
}

/// Session side of the driver boundary
pub(crate) trait SessionReporter: Send + Sync {
    fn is_current(&self, generation: u64) -> bool;

    fn report(&self, generation: u64, backend: BackendId, report: Report);
}

pub(crate) struct AttemptDriver {
    adapter: Arc<dyn BackendAdapter>,
    generation: u64,
    purpose: CryptoPurpose,
    view: Option<ViewTarget>,
    machine: RetryStateMachine,
    timing: Arc<dyn DebounceTiming>,
    reporter: Arc<dyn SessionReporter>,
    ended: watch::Receiver<bool>,
}

enum Wake {
    Event(SinkEvent),
    Settled,
    Ended,
}

impl AttemptDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: Arc<dyn BackendAdapter>,
        generation: u64,
        purpose: CryptoPurpose,
        view: Option<ViewTarget>,
        machine: RetryStateMachine,
        timing: Arc<dyn DebounceTiming>,
        reporter: Arc<dyn SessionReporter>,
        ended: watch::Receiver<bool>,
    ) -> Self {
        Self {
            adapter,
            generation,
            purpose,
            view,
            machine,
            timing,
            reporter,
            ended,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let backend = self.adapter.backend_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut ended = self.ended.clone();
        let mut invocation = 0u64;

        let Some(mut handle) = self.invoke(&tx, invocation) else {
            return;
        };

        loop {
            let deadline = self.machine.settle_deadline();
            let wake = tokio::select! {
                Some(event) = rx.recv() => Wake::Event(event),
                _ = settled(deadline) => Wake::Settled,
                _ = session_ended(&mut ended) => Wake::Ended,
            };

            let step = match wake {
                Wake::Ended => {
                    trace!("{} stops listening, session ended", backend);
                    self.machine.abandon();
                    handle.cancel();
                    return;
                }
                Wake::Settled => self.machine.flush(Instant::now()),
                Wake::Event(event) if event.invocation != invocation => {
                    trace!("{} dropping event of invocation {}", backend, event.invocation);
                    continue;
                }
                Wake::Event(event) => self.machine.on_event(Instant::now(), event.event),
            };

            match step {
                Step::Ignore => {}
                Step::Help(message) => self.send(Report::Help(message)),
                Step::Succeed(crypto) => {
                    self.send(Report::Success(crypto));
                    return;
                }
                Step::Cancel(origin) => {
                    self.send(Report::Canceled(origin));
                    return;
                }
                Step::Fail(reason) => {
                    self.send(Report::Failure { reason, done: true });
                    handle.cancel();
                    self.adapter.stop();
                    return;
                }
                Step::Retry { forward } => {
                    if let Some(reason) = forward {
                        self.send(Report::Failure {
                            reason,
                            done: false,
                        });
                    }
                    handle.cancel();
                    self.adapter.stop();

                    let window = self.timing.debounce_window();
                    tokio::select! {
                        _ = tokio::time::sleep(window) => {}
                        _ = session_ended(&mut ended) => {
                            self.machine.abandon();
                            return;
                        }
                    }

                    if !self.reporter.is_current(self.generation) {
                        debug!("{} not retrying, session no longer current", backend);
                        self.machine.abandon();
                        return;
                    }

                    invocation += 1;
                    debug!("{} retry #{}", backend, self.machine.retries() + 1);
                    match self.invoke(&tx, invocation) {
                        Some(next) => handle = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Start one invocation of the adapter
    fn invoke(&mut self, tx: &mpsc::UnboundedSender<SinkEvent>, invocation: u64) -> Option<CancelHandle> {
        let window = self.timing.debounce_window();
        if !self.machine.begin(Instant::now(), window) {
            return None;
        }

        let (handle, signal) = CancelHandle::new();
        let sink = AdapterSink::new(invocation, tx.clone(), signal.clone());
        self.adapter.authenticate(AttemptContext {
            purpose: self.purpose.clone(),
            view: self.view.clone(),
            cancel: signal,
            sink,
        });
        Some(handle)
    }

    fn send(&self, report: Report) {
        self.reporter
            .report(self.generation, self.adapter.backend_id(), report);
    }
}

/// Resolves once a held event is due; never without one
async fn settled(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// Resolves when the session is marked ended or its sender is dropped
async fn session_ended(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::RestartPredicate;
    use crate::lockout::LockoutTracker;
    use crate::lockout_store::MemoryLockoutStore;
    use crate::sim::{SimBackendSpec, SimEvent, SimStep, SimulatedAdapter};
    use crate::timing::FixedTiming;
    use biogate_core::failure::native;
    use biogate_core::Modality;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const WINDOW: Duration = Duration::from_millis(20);

    struct Collector {
        current: AtomicBool,
        reports: Mutex<Vec<Report>>,
    }

    impl SessionReporter for Collector {
        fn is_current(&self, _generation: u64) -> bool {
            self.current.load(Ordering::SeqCst)
        }

        fn report(&self, _generation: u64, _backend: BackendId, report: Report) {
            self.reports.lock().push(report);
        }
    }

    fn drive(
        adapter: Arc<SimulatedAdapter>,
        restart: RestartPredicate,
    ) -> (JoinHandle<()>, Arc<Collector>, watch::Sender<bool>) {
        let collector = Arc::new(Collector {
            current: AtomicBool::new(true),
            reports: Mutex::new(Vec::new()),
        });
        let tracker = Arc::new(LockoutTracker::new(Arc::new(MemoryLockoutStore::new()), 5));
        let (ended_tx, ended_rx) = watch::channel(false);
        let driver = AttemptDriver::new(
            adapter.clone(),
            1,
            CryptoPurpose::encrypt(),
            None,
            RetryStateMachine::new(adapter.modality(), WINDOW, restart, tracker),
            Arc::new(FixedTiming(WINDOW)),
            collector.clone(),
            ended_rx,
        );
        (driver.spawn(), collector, ended_tx)
    }

    fn face(spec: impl FnOnce(SimBackendSpec) -> SimBackendSpec) -> Arc<SimulatedAdapter> {
        Arc::new(SimulatedAdapter::new(spec(SimBackendSpec::new(BackendId::new(
            1,
            Modality::Face,
        )))))
    }

    #[tokio::test]
    async fn test_timeout_is_forwarded_then_retried() {
        let adapter = face(|s| {
            s.with_script(vec![SimStep::after(50, SimEvent::Native { code: native::TIMEOUT })])
                .with_script(vec![SimStep::after(50, SimEvent::Success { token: None })])
        });
        let (task, collector, _ended) = drive(adapter.clone(), RestartPredicate::never());
        task.await.unwrap();

        let reports = collector.reports.lock().clone();
        assert_eq!(reports.len(), 2);
        assert_eq!(
            reports[0],
            Report::Failure {
                reason: FailureReason::Timeout,
                done: false
            }
        );
        assert!(matches!(reports[1], Report::Success(Some(_))));
        assert_eq!(adapter.authenticate_calls(), 2);
        assert_eq!(adapter.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_acknowledgement_of_retried_invocation_is_dropped() {
        let adapter = face(|s| {
            s.ack_stop()
                .with_script(vec![
                    SimStep::after(50, SimEvent::Native { code: native::TIMEOUT }),
                    SimStep::after(500, SimEvent::Success { token: None }),
                ])
                .with_script(vec![SimStep::after(50, SimEvent::Success { token: None })])
        });
        let (task, collector, _ended) = drive(adapter.clone(), RestartPredicate::never());
        task.await.unwrap();

        let reports = collector.reports.lock().clone();
        assert_eq!(reports.len(), 2);
        assert_eq!(
            reports[0],
            Report::Failure {
                reason: FailureReason::Timeout,
                done: false
            }
        );
        assert!(matches!(reports[1], Report::Success(_)));
    }

    #[tokio::test]
    async fn test_stop_acknowledgement_after_failure_is_not_reported() {
        let adapter = face(|s| {
            s.ack_stop().with_script(vec![
                SimStep::after(50, SimEvent::Native { code: native::HW_UNAVAILABLE }),
                SimStep::after(500, SimEvent::Success { token: None }),
            ])
        });
        let (task, collector, _ended) = drive(adapter.clone(), RestartPredicate::never());
        task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            collector.reports.lock().clone(),
            vec![Report::Failure {
                reason: FailureReason::HardwareUnavailable,
                done: true
            }]
        );
        assert_eq!(adapter.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_predicate_retry_is_not_forwarded() {
        let adapter = face(|s| {
            s.with_script(vec![SimStep::after(
                50,
                SimEvent::Failure {
                    reason: FailureReason::AuthenticationFailed,
                },
            )])
            .with_script(vec![SimStep::after(50, SimEvent::Success { token: None })])
        });
        let restart = RestartPredicate::limited(vec![FailureReason::AuthenticationFailed], 1);
        let (task, collector, _ended) = drive(adapter.clone(), restart);
        task.await.unwrap();

        let reports = collector.reports.lock().clone();
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0], Report::Success(_)));
    }

    #[tokio::test]
    async fn test_burst_yields_one_failure() {
        let adapter = face(|s| {
            s.ignore_stop().with_script(vec![
                SimStep::after(50, SimEvent::Native { code: native::HW_UNAVAILABLE }),
                SimStep::after(2, SimEvent::Native { code: native::HW_UNAVAILABLE }),
                SimStep::after(2, SimEvent::Native { code: native::HW_UNAVAILABLE }),
            ])
        });
        let (task, collector, _ended) = drive(adapter, RestartPredicate::never());
        task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(
            collector.reports.lock().clone(),
            vec![Report::Failure {
                reason: FailureReason::HardwareUnavailable,
                done: true
            }]
        );
    }

    #[tokio::test]
    async fn test_burst_inside_start_window_is_reported_once() {
        let adapter = face(|s| {
            s.with_script(vec![
                SimStep::after(2, SimEvent::Native { code: native::LOCKOUT }),
                SimStep::after(2, SimEvent::Native { code: native::LOCKOUT }),
                SimStep::after(2, SimEvent::Native { code: native::LOCKOUT }),
            ])
        });
        let (task, collector, _ended) = drive(adapter.clone(), RestartPredicate::never());
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            collector.reports.lock().clone(),
            vec![Report::Failure {
                reason: FailureReason::LockedOut,
                done: true
            }]
        );
        assert_eq!(adapter.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_inside_start_window_is_reported() {
        let adapter = face(|s| {
            s.with_script(vec![SimStep::after(
                5,
                SimEvent::Native {
                    code: native::USER_CANCELED,
                },
            )])
        });
        let (task, collector, _ended) = drive(adapter, RestartPredicate::never());
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            collector.reports.lock().clone(),
            vec![Report::Canceled(CancelOrigin::User)]
        );
    }

    #[tokio::test]
    async fn test_success_inside_start_window_supersedes_error() {
        let adapter = face(|s| {
            s.with_script(vec![
                SimStep::after(2, SimEvent::Native { code: native::HW_UNAVAILABLE }),
                SimStep::after(3, SimEvent::Success { token: None }),
            ])
        });
        let (task, collector, _ended) = drive(adapter, RestartPredicate::never());
        task.await.unwrap();

        let reports = collector.reports.lock().clone();
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0], Report::Success(_)));
    }

    #[tokio::test]
    async fn test_session_end_stops_listening() {
        let adapter = face(|s| {
            s.ignore_stop()
                .with_script(vec![SimStep::after(100, SimEvent::Success { token: None })])
        });
        let (task, collector, ended) = drive(adapter.clone(), RestartPredicate::never());

        tokio::time::sleep(Duration::from_millis(20)).await;
        ended.send_replace(true);
        task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(collector.reports.lock().is_empty());
        assert_eq!(adapter.authenticate_calls(), 1);
    }

    #[tokio::test]
    async fn test_no_retry_for_stale_session() {
        let adapter = face(|s| {
            s.with_script(vec![SimStep::after(50, SimEvent::Native { code: native::TIMEOUT })])
        });
        let (task, collector, _ended) = drive(adapter.clone(), RestartPredicate::never());
        collector.current.store(false, Ordering::SeqCst);
        task.await.unwrap();

        assert_eq!(adapter.authenticate_calls(), 1);
        assert_eq!(collector.reports.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_user_cancel_is_reported() {
        let adapter = face(|s| {
            s.with_script(vec![SimStep::after(
                50,
                SimEvent::Native {
                    code: native::NEGATIVE_BUTTON,
                },
            )])
        });
        let (task, collector, _ended) = drive(adapter, RestartPredicate::never());
        task.await.unwrap();

        assert_eq!(
            collector.reports.lock().clone(),
            vec![Report::Canceled(CancelOrigin::NegativeButton)]
        );
    }
}

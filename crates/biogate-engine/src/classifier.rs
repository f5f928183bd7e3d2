//! Failure classifier and per-adapter retry state machine
//!
//! ```text
//! Idle -> Attempting -> RetryScheduled -> Attempting
//!                    -> LockedOut | Succeeded | Failed | Canceled
//! ```
//!
//! The machine is pure with respect to time: callers pass `now`, which keeps
//! the debounce rules testable without sleeping.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use biogate_core::{CancelOrigin, CryptoObject, FailureReason, Modality};

use crate::adapter::RawEvent;
use crate::lockout::{Escalation, LockoutTracker};

/// Caller-supplied decision whether a failure should be retried silently
#[derive(Clone)]
pub struct RestartPredicate(Arc<dyn Fn(FailureReason) -> bool + Send + Sync>);

impl RestartPredicate {
    pub fn new(f: impl Fn(FailureReason) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Retry nothing beyond what the state machine always retries
    pub fn never() -> Self {
        Self::new(|_| false)
    }

    /// Retry the listed reasons at most `max` times in total
    ///
    /// The budget is shared by every clone, so build one per attempt.
    pub fn limited(reasons: Vec<FailureReason>, max: u32) -> Self {
        let used = AtomicU32::new(0);
        Self::new(move |reason| {
            if !reasons.contains(&reason) {
                return false;
            }
            used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
        })
    }

    pub fn should_restart(&self, reason: FailureReason) -> bool {
        (self.0)(reason)
    }
}

impl Default for RestartPredicate {
    fn default() -> Self {
        Self::never()
    }
}

impl fmt::Debug for RestartPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RestartPredicate(..)")
    }
}

/// How the debouncer treats one raw error or cancel callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new logical event, act on it now
    Fresh,
    /// First callback inside the start window; hold it until the burst settles
    Settling,
    /// Same logical event as the previous callback
    Duplicate,
}

/// Collapses bursts of raw error callbacks
///
/// A callback within the window of the previous raw callback is a duplicate.
/// The first callback within the window of the (re)invocation start is held
/// rather than acted on, and every later one in the same burst collapses
/// onto it. Every callback slides the window, so a continuous burst yields
/// one event.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    mark: Option<Instant>,
    at_start: bool,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            mark: None,
            at_start: false,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Mark the start of an invocation
    pub fn restart(&mut self, now: Instant) {
        self.mark = Some(now);
        self.at_start = true;
    }

    pub fn accept(&mut self, now: Instant) -> Admission {
        let within = self
            .mark
            .is_some_and(|mark| now.saturating_duration_since(mark) <= self.window);
        let admission = match (within, self.at_start) {
            (false, _) => Admission::Fresh,
            (true, true) => Admission::Settling,
            (true, false) => Admission::Duplicate,
        };
        self.at_start = false;
        self.mark = Some(now);
        admission
    }

    /// When the current burst is over if nothing else arrives
    pub fn quiet_at(&self) -> Option<Instant> {
        self.mark.map(|mark| mark + self.window)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    Attempting,
    RetryScheduled,
    /// Terminal for this attempt
    LockedOut,
    Succeeded,
    Failed,
    Canceled,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::LockedOut
                | AttemptState::Succeeded
                | AttemptState::Failed
                | AttemptState::Canceled
        )
    }
}

/// What the driver must do after one raw event
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Duplicate, late or irrelevant
    Ignore,
    Help(String),
    Succeed(Option<CryptoObject>),
    /// Explicit user cancel; no retry
    Cancel(CancelOrigin),
    /// Stop, wait one window, re-invoke; forward the reason first if set
    Retry { forward: Option<FailureReason> },
    /// Forward once, then stop
    Fail(FailureReason),
}

/// Classifier plus retry bookkeeping for one adapter within one session
pub struct RetryStateMachine {
    modality: Modality,
    state: AttemptState,
    debouncer: Debouncer,
    restart: RestartPredicate,
    tracker: Arc<LockoutTracker>,
    retries: u32,
    /// Error or cancel held while a start-window burst settles
    held: Option<RawEvent>,
}

impl RetryStateMachine {
    pub fn new(
        modality: Modality,
        window: Duration,
        restart: RestartPredicate,
        tracker: Arc<LockoutTracker>,
    ) -> Self {
        Self {
            modality,
            state: AttemptState::Idle,
            debouncer: Debouncer::new(window),
            restart,
            tracker,
            retries: 0,
            held: None,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Enter `Attempting` for a fresh or retried invocation
    ///
    /// `window` is re-read by the caller on every invocation since the
    /// runtime animation scale may change between attempts.
    pub fn begin(&mut self, now: Instant, window: Duration) -> bool {
        match self.state {
            AttemptState::Idle => {}
            AttemptState::RetryScheduled => self.retries += 1,
            _ => return false,
        }
        self.held = None;
        self.debouncer.set_window(window);
        self.debouncer.restart(now);
        self.state = AttemptState::Attempting;
        true
    }

    /// Mark the attempt abandoned from outside (session ended, global cancel)
    pub fn abandon(&mut self) {
        if !self.state.is_terminal() {
            self.state = AttemptState::Canceled;
        }
    }

    pub fn on_event(&mut self, now: Instant, event: RawEvent) -> Step {
        if self.state != AttemptState::Attempting {
            debug!("{} ignoring {:?} in state {:?}", self.modality, event, self.state);
            return Step::Ignore;
        }

        match event {
            RawEvent::Help(message) => Step::Help(message),
            RawEvent::Succeeded(crypto) => {
                if let Some(held) = self.held.take() {
                    debug!("{} success supersedes held {:?}", self.modality, held);
                }
                self.state = AttemptState::Succeeded;
                self.tracker.record_success(self.modality);
                Step::Succeed(crypto)
            }
            event => match self.debouncer.accept(now) {
                Admission::Fresh => match self.held.take() {
                    // The held event was never flushed; it is the one that counts
                    Some(held) => {
                        debug!("{} dropping {:?} behind held {:?}", self.modality, event, held);
                        self.resolve(held)
                    }
                    None => self.resolve(event),
                },
                Admission::Settling => {
                    debug!("{} holding {:?} until the burst settles", self.modality, event);
                    self.held = Some(event);
                    Step::Ignore
                }
                Admission::Duplicate => {
                    debug!("{} debounced {:?}", self.modality, event);
                    Step::Ignore
                }
            },
        }
    }

    /// When a held event is due, if one is held
    pub fn settle_deadline(&self) -> Option<Instant> {
        self.held.as_ref().and(self.debouncer.quiet_at())
    }

    /// Act on the held event once its burst has been quiet for a window
    pub fn flush(&mut self, now: Instant) -> Step {
        if self.state != AttemptState::Attempting {
            self.held = None;
            return Step::Ignore;
        }
        match self.settle_deadline() {
            Some(deadline) if now >= deadline => match self.held.take() {
                Some(held) => self.resolve(held),
                None => Step::Ignore,
            },
            _ => Step::Ignore,
        }
    }

    fn resolve(&mut self, event: RawEvent) -> Step {
        match event {
            RawEvent::Error(reason) => self.classify(reason),
            RawEvent::Canceled(origin) => {
                self.state = AttemptState::Canceled;
                Step::Cancel(origin)
            }
            RawEvent::Help(message) => Step::Help(message),
            RawEvent::Succeeded(crypto) => {
                self.state = AttemptState::Succeeded;
                self.tracker.record_success(self.modality);
                Step::Succeed(crypto)
            }
        }
    }

    fn classify(&mut self, reason: FailureReason) -> Step {
        if reason == FailureReason::Timeout {
            self.state = AttemptState::RetryScheduled;
            return Step::Retry {
                forward: Some(FailureReason::Timeout),
            };
        }

        if self.restart.should_restart(reason) {
            self.state = AttemptState::RetryScheduled;
            return Step::Retry { forward: None };
        }

        if reason.escalates() {
            return match self.tracker.record_escalating_failure(self.modality) {
                Escalation::Locked => {
                    self.state = AttemptState::LockedOut;
                    Step::Fail(FailureReason::LockedOut)
                }
                Escalation::Counted { .. } => {
                    self.state = AttemptState::Failed;
                    Step::Fail(reason)
                }
            };
        }

        self.state = AttemptState::Failed;
        Step::Fail(reason)
    }
}

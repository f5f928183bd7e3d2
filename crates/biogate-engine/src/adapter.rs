//! Backend adapter contract
//!
//! Every concrete sensor technology sits behind [`BackendAdapter`]. The
//! orchestrator never sees native error codes or native callbacks: an adapter
//! reports through the [`AdapterSink`] it was handed for one invocation, and
//! translates its native codes into the closed taxonomy first.
//!
//! # Contract
//!
//! - `authenticate` is fire-and-forget. Results arrive later through the sink,
//!   never synchronously.
//! - A stop may be requested at any point, including before the first event.
//!   Stop is advisory: the adapter may keep producing events, and the sink and
//!   the orchestrator discard them.
//! - At most one terminal event (success or cancel) is delivered per
//!   invocation. The sink enforces this with a resolve-once guard, and it
//!   swallows a success that arrives after the stop was requested.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use biogate_core::{
    classify_native_code, BackendId, CancelOrigin, CryptoObject, CryptoPurpose, FailureReason,
    Modality, NativeOutcome, ViewTarget,
};

/// One sensor technology
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Identity this adapter was constructed for
    fn backend_id(&self) -> BackendId;

    /// Stable small integer used for result attribution
    fn tag(&self) -> u32 {
        self.backend_id().id
    }

    fn modality(&self) -> Modality {
        self.backend_id().modality
    }

    /// Whether the platform service behind this adapter can be reached
    async fn is_manager_accessible(&self) -> bool;

    /// Whether the sensor exists on this device
    async fn is_hardware_present(&self) -> bool;

    /// Whether the user enrolled at least one template
    async fn has_enrolled(&self) -> bool;

    /// Transient lockout reported by the backend itself
    async fn is_locked_out(&self) -> bool;

    /// Start one invocation. Must return promptly.
    fn authenticate(&self, ctx: AttemptContext);

    /// Advisory stop of the current invocation
    fn stop(&self) {}

    /// Free resources before the adapter is dropped by a plugin unload
    fn release(&self) {}
}

/// Builds one adapter instance. Construction may block on hardware queries.
pub trait AdapterFactory: Send + Sync {
    fn backend_id(&self) -> BackendId;

    fn create(&self) -> crate::Result<Arc<dyn BackendAdapter>>;
}

/// Everything an adapter needs for one invocation
pub struct AttemptContext {
    pub purpose: CryptoPurpose,
    pub view: Option<ViewTarget>,
    pub cancel: CancelSignal,
    pub sink: AdapterSink,
}

/// Raw event reported by an adapter, already in taxonomy terms
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    /// Advisory progress message ("move finger slightly")
    Help(String),
    Error(FailureReason),
    Canceled(CancelOrigin),
    Succeeded(Option<CryptoObject>),
}

impl RawEvent {
    pub fn from_native_code(code: i32) -> Self {
        match classify_native_code(code) {
            NativeOutcome::Failure(reason) => RawEvent::Error(reason),
            NativeOutcome::Canceled(origin) => RawEvent::Canceled(origin),
        }
    }

    /// Success and explicit cancel end an invocation from the adapter's side
    pub fn is_terminal(&self) -> bool {
        matches!(self, RawEvent::Succeeded(_) | RawEvent::Canceled(_))
    }
}

/// Event tagged with the invocation that produced it
#[derive(Debug)]
pub(crate) struct SinkEvent {
    pub invocation: u64,
    pub event: RawEvent,
}

/// Reporting channel handed to an adapter for one invocation
#[derive(Clone)]
pub struct AdapterSink {
    invocation: u64,
    tx: mpsc::UnboundedSender<SinkEvent>,
    resolved: Arc<AtomicBool>,
    cancel: CancelSignal,
}

impl AdapterSink {
    pub(crate) fn new(
        invocation: u64,
        tx: mpsc::UnboundedSender<SinkEvent>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            invocation,
            tx,
            resolved: Arc::new(AtomicBool::new(false)),
            cancel,
        }
    }

    pub fn help(&self, message: impl Into<String>) -> bool {
        self.deliver(RawEvent::Help(message.into()))
    }

    pub fn error(&self, reason: FailureReason) -> bool {
        self.deliver(RawEvent::Error(reason))
    }

    /// Report a platform error code; it is classified before leaving the sink
    pub fn native_error(&self, code: i32) -> bool {
        self.deliver(RawEvent::from_native_code(code))
    }

    pub fn canceled(&self, origin: CancelOrigin) -> bool {
        self.deliver(RawEvent::Canceled(origin))
    }

    pub fn succeeded(&self, crypto: Option<CryptoObject>) -> bool {
        self.deliver(RawEvent::Succeeded(crypto))
    }

    /// Forward an event; returns whether it left the sink
    pub fn deliver(&self, event: RawEvent) -> bool {
        if self.resolved.load(Ordering::Acquire) {
            trace!(invocation = self.invocation, "Invocation already resolved, dropping {:?}", event);
            return false;
        }

        if event.is_terminal() {
            if matches!(event, RawEvent::Succeeded(_)) && self.cancel.is_cancelled() {
                debug!(invocation = self.invocation, "Swallowing success delivered after stop");
                return false;
            }
            if self.resolved.swap(true, Ordering::AcqRel) {
                return false;
            }
        }

        self.tx
            .send(SinkEvent {
                invocation: self.invocation,
                event,
            })
            .is_ok()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }
}

/// Cooperative cancellation signal observed by an adapter
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop was requested or the invocation was abandoned
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Orchestrator-side half of a [`CancelSignal`]
#[derive(Debug)]
pub(crate) struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelSignal { rx })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use biogate_core::failure::native;

    fn sink() -> (AdapterSink, CancelHandle, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, signal) = CancelHandle::new();
        (AdapterSink::new(7, tx, signal), handle, rx)
    }

    #[test]
    fn test_native_code_is_classified_in_sink() {
        let (sink, _handle, mut rx) = sink();
        assert!(sink.native_error(native::TIMEOUT));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.invocation, 7);
        assert_eq!(event.event, RawEvent::Error(FailureReason::Timeout));
    }

    #[test]
    fn test_only_one_terminal_event() {
        let (sink, _handle, mut rx) = sink();
        assert!(sink.succeeded(None));
        assert!(!sink.succeeded(None));
        assert!(!sink.canceled(CancelOrigin::User));
        assert!(!sink.help("late"));

        assert!(matches!(rx.try_recv().unwrap().event, RawEvent::Succeeded(None)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_errors_are_not_terminal() {
        let (sink, _handle, mut rx) = sink();
        assert!(sink.error(FailureReason::SensorFailed));
        assert!(sink.error(FailureReason::SensorFailed));
        assert!(!sink.is_resolved());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_success_after_stop_is_swallowed() {
        let (sink, handle, mut rx) = sink();
        handle.cancel();
        assert!(!sink.succeeded(None));
        assert!(rx.try_recv().is_err());

        // A cancel acknowledgement still goes through
        assert!(sink.canceled(CancelOrigin::User));
    }

    #[tokio::test]
    async fn test_cancel_signal_resolves() {
        let (handle, signal) = CancelHandle::new();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });
        handle.cancel();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_handle_releases_waiters() {
        let (handle, signal) = CancelHandle::new();
        drop(handle);
        signal.cancelled().await;
    }
}

//! Caller-facing result contract and the serialized delivery queue
//!
//! All listener callbacks run on one consumer task, so a caller sees
//! single-threaded semantics no matter how many adapters run underneath.
//! Sessions hold only a weak reference to the listener; a listener that is
//! gone at delivery time turns the delivery into a no-op.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::trace;
use uuid::Uuid;

use biogate_core::{CryptoObject, FailureReason, Modality};

/// A failure forwarded to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureReport {
    pub reason: FailureReason,
    pub modality: Modality,
    /// Set on the single failure that ends the session
    pub terminal: bool,
}

/// Callbacks of one authentication session
///
/// At most one of `on_success`, a terminal `on_failure` or `on_canceled`
/// is invoked per session.
pub trait AuthListener: Send + Sync {
    fn on_success(&self, modality: Modality, crypto: Option<CryptoObject>);

    fn on_help(&self, _modality: Modality, _message: &str) {}

    fn on_failure(&self, failure: FailureReport);

    fn on_canceled(&self, reason: Option<FailureReason>, modality: Modality);
}

/// Owned form of one callback
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    Success {
        modality: Modality,
        crypto: Option<CryptoObject>,
    },
    Help {
        modality: Modality,
        message: String,
    },
    Failure(FailureReport),
    Canceled {
        reason: Option<FailureReason>,
        modality: Modality,
    },
}

impl AuthEvent {
    pub fn is_terminal(&self) -> bool {
        match self {
            AuthEvent::Success { .. } | AuthEvent::Canceled { .. } => true,
            AuthEvent::Failure(report) => report.terminal,
            AuthEvent::Help { .. } => false,
        }
    }

    fn deliver_to(self, listener: &dyn AuthListener) {
        match self {
            AuthEvent::Success { modality, crypto } => listener.on_success(modality, crypto),
            AuthEvent::Help { modality, message } => listener.on_help(modality, &message),
            AuthEvent::Failure(report) => listener.on_failure(report),
            AuthEvent::Canceled { reason, modality } => listener.on_canceled(reason, modality),
        }
    }
}

struct Delivery {
    session: Uuid,
    listener: Weak<dyn AuthListener>,
    event: AuthEvent,
}

/// Single consumer queue feeding listener callbacks in order
pub(crate) struct DeliveryQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Enqueue a callback; the consumer task starts on first use
    pub fn push(&self, session: Uuid, listener: &Weak<dyn AuthListener>, event: AuthEvent) {
        if let Some(mut rx) = self.rx.lock().take() {
            tokio::spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    match delivery.listener.upgrade() {
                        Some(listener) => delivery.event.deliver_to(listener.as_ref()),
                        None => trace!(
                            session = %delivery.session,
                            "Listener gone, dropping {:?}",
                            delivery.event
                        ),
                    }
                }
            });
        }

        let _ = self.tx.send(Delivery {
            session,
            listener: listener.clone(),
            event,
        });
    }
}

/// Listener that records every callback, for tests and tooling
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<AuthEvent>>,
    notify: Notify,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<AuthEvent> {
        self.events.lock().clone()
    }

    pub fn terminal_events(&self) -> Vec<AuthEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.is_terminal())
            .cloned()
            .collect()
    }

    /// Wait until a terminal callback was recorded
    pub async fn wait_for_terminal(&self, timeout: Duration) -> Option<AuthEvent> {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if let Some(event) = self.terminal_events().into_iter().next() {
                    return event;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    fn record(&self, event: AuthEvent) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }
}

impl AuthListener for RecordingListener {
    fn on_success(&self, modality: Modality, crypto: Option<CryptoObject>) {
        self.record(AuthEvent::Success { modality, crypto });
    }

    fn on_help(&self, modality: Modality, message: &str) {
        self.record(AuthEvent::Help {
            modality,
            message: message.to_string(),
        });
    }

    fn on_failure(&self, failure: FailureReport) {
        self.record(AuthEvent::Failure(failure));
    }

    fn on_canceled(&self, reason: Option<FailureReason>, modality: Modality) {
        self.record(AuthEvent::Canceled { reason, modality });
    }
}

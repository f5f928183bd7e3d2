//! Scripted simulated backend
//!
//! Implements the adapter contract without hardware. Each invocation plays a
//! script of timed events; the adapter records how often it was started,
//! stopped and released. Used by the conformance tests and by the CLI.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use biogate_core::{BackendId, CancelOrigin, CryptoObject, FailureReason, Modality};

use crate::adapter::{AdapterFactory, AttemptContext, BackendAdapter};
use crate::error::{EngineError, Result};

fn yes() -> bool {
    true
}

/// Description of one simulated backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimBackendSpec {
    #[serde(flatten)]
    pub backend: BackendId,
    #[serde(default = "yes")]
    pub accessible: bool,
    #[serde(default = "yes")]
    pub present: bool,
    #[serde(default = "yes")]
    pub enrolled: bool,
    #[serde(default)]
    pub locked_out: bool,
    /// Offered through plugin discovery instead of the static list
    #[serde(default)]
    pub plugin: bool,
    #[serde(default)]
    pub fail_construction: bool,
    /// Blocking delay inside the constructor
    #[serde(default)]
    pub construct_delay_ms: u64,
    /// Deliver a native cancel acknowledgement when stopped
    #[serde(default)]
    pub ack_stop: bool,
    /// Keep playing the script after a stop request
    #[serde(default)]
    pub ignore_stop: bool,
    /// One script per invocation; the last one repeats
    #[serde(default)]
    pub scripts: Vec<Vec<SimStep>>,
}

impl SimBackendSpec {
    pub fn new(backend: BackendId) -> Self {
        Self {
            backend,
            accessible: true,
            present: true,
            enrolled: true,
            locked_out: false,
            plugin: false,
            fail_construction: false,
            construct_delay_ms: 0,
            ack_stop: false,
            ignore_stop: false,
            scripts: Vec::new(),
        }
    }

    pub fn with_script(mut self, script: Vec<SimStep>) -> Self {
        self.scripts.push(script);
        self
    }

    pub fn enrolled(mut self, enrolled: bool) -> Self {
        self.enrolled = enrolled;
        self
    }

    pub fn present(mut self, present: bool) -> Self {
        self.present = present;
        self
    }

    pub fn plugin(mut self) -> Self {
        self.plugin = true;
        self
    }

    pub fn ignore_stop(mut self) -> Self {
        self.ignore_stop = true;
        self
    }

    pub fn ack_stop(mut self) -> Self {
        self.ack_stop = true;
        self
    }
}

/// One timed event in a script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimStep {
    /// Delay after the previous step
    #[serde(default)]
    pub after_ms: u64,
    pub event: SimEvent,
}

impl SimStep {
    pub fn after(ms: u64, event: SimEvent) -> Self {
        Self { after_ms: ms, event }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimEvent {
    Help { message: String },
    Native { code: i32 },
    Failure { reason: FailureReason },
    Success {
        #[serde(default)]
        token: Option<Vec<u8>>,
    },
    Cancel { origin: CancelOrigin },
}

#[derive(Debug, Clone, Copy)]
struct SimFlags {
    accessible: bool,
    present: bool,
    enrolled: bool,
    locked_out: bool,
}

/// Simulated adapter instance
pub struct SimulatedAdapter {
    spec: SimBackendSpec,
    flags: Mutex<SimFlags>,
    authenticate_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    release_calls: AtomicUsize,
}

impl SimulatedAdapter {
    pub fn new(spec: SimBackendSpec) -> Self {
        let flags = SimFlags {
            accessible: spec.accessible,
            present: spec.present,
            enrolled: spec.enrolled,
            locked_out: spec.locked_out,
        };
        Self {
            spec,
            flags: Mutex::new(flags),
            authenticate_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
        }
    }

    pub fn authenticate_calls(&self) -> usize {
        self.authenticate_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub fn set_enrolled(&self, enrolled: bool) {
        self.flags.lock().enrolled = enrolled;
    }

    pub fn set_present(&self, present: bool) {
        self.flags.lock().present = present;
    }

    pub fn set_locked_out(&self, locked_out: bool) {
        self.flags.lock().locked_out = locked_out;
    }

    fn script_for(&self, invocation: usize) -> Vec<SimStep> {
        self.spec
            .scripts
            .get(invocation)
            .or_else(|| self.spec.scripts.last())
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BackendAdapter for SimulatedAdapter {
    fn backend_id(&self) -> BackendId {
        self.spec.backend
    }

    async fn is_manager_accessible(&self) -> bool {
        self.flags.lock().accessible
    }

    async fn is_hardware_present(&self) -> bool {
        self.flags.lock().present
    }

    async fn has_enrolled(&self) -> bool {
        self.flags.lock().enrolled
    }

    async fn is_locked_out(&self) -> bool {
        self.flags.lock().locked_out
    }

    fn authenticate(&self, ctx: AttemptContext) {
        let invocation = self.authenticate_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script_for(invocation);
        let backend = self.spec.backend;
        let ack_stop = self.spec.ack_stop;
        let ignore_stop = self.spec.ignore_stop;
        debug!("Simulated {} invocation {} ({} steps)", backend, invocation, script.len());

        tokio::spawn(async move {
            let AttemptContext {
                purpose,
                cancel,
                sink,
                ..
            } = ctx;

            for step in script {
                if ignore_stop {
                    tokio::time::sleep(Duration::from_millis(step.after_ms)).await;
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(step.after_ms)) => {}
                        _ = cancel.cancelled() => {
                            if ack_stop {
                                sink.native_error(biogate_core::failure::native::CANCELED);
                            }
                            return;
                        }
                    }
                }

                match step.event {
                    SimEvent::Help { message } => {
                        sink.help(message);
                    }
                    SimEvent::Native { code } => {
                        sink.native_error(code);
                    }
                    SimEvent::Failure { reason } => {
                        sink.error(reason);
                    }
                    SimEvent::Success { token } => {
                        sink.succeeded(Some(CryptoObject::new(purpose.clone(), token)));
                    }
                    SimEvent::Cancel { origin } => {
                        sink.canceled(origin);
                    }
                }
            }
        });
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory producing [`SimulatedAdapter`]s from a spec
pub struct SimulatedFactory {
    spec: SimBackendSpec,
    instances: Mutex<Vec<Arc<SimulatedAdapter>>>,
}

impl SimulatedFactory {
    pub fn new(spec: SimBackendSpec) -> Self {
        Self {
            spec,
            instances: Mutex::new(Vec::new()),
        }
    }

    pub fn spec(&self) -> &SimBackendSpec {
        &self.spec
    }

    pub fn modality(&self) -> Modality {
        self.spec.backend.modality
    }

    /// Most recently constructed instance
    pub fn last_instance(&self) -> Option<Arc<SimulatedAdapter>> {
        self.instances.lock().last().cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().len()
    }
}

impl AdapterFactory for SimulatedFactory {
    fn backend_id(&self) -> BackendId {
        self.spec.backend
    }

    fn create(&self) -> Result<Arc<dyn BackendAdapter>> {
        if self.spec.construct_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.spec.construct_delay_ms));
        }
        if self.spec.fail_construction {
            return Err(EngineError::Construction(
                self.spec.backend,
                "simulated constructor failure".to_string(),
            ));
        }
        let adapter = Arc::new(SimulatedAdapter::new(self.spec.clone()));
        self.instances.lock().push(Arc::clone(&adapter));
        Ok(adapter)
    }
}

/// Load a list of simulated backends from a JSON file
pub fn load_specs(path: &std::path::Path) -> Result<Vec<SimBackendSpec>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_json_defaults() {
        let specs: Vec<SimBackendSpec> = serde_json::from_str(
            r#"[
                { "id": 10, "modality": "face" },
                {
                    "id": 5, "modality": "fingerprint", "enrolled": false,
                    "scripts": [[
                        { "after_ms": 20, "event": { "kind": "native", "code": 3 } },
                        { "event": { "kind": "success" } }
                    ]]
                }
            ]"#,
        )
        .unwrap();

        assert_eq!(specs[0].backend, BackendId::new(10, Modality::Face));
        assert!(specs[0].present && specs[0].enrolled && specs[0].accessible);
        assert!(!specs[1].enrolled);
        assert_eq!(specs[1].scripts[0].len(), 2);
        assert_eq!(specs[1].scripts[0][1].after_ms, 0);
    }

    #[test]
    fn test_factory_failure() {
        let mut spec = SimBackendSpec::new(BackendId::new(1, Modality::Iris));
        spec.fail_construction = true;
        let factory = SimulatedFactory::new(spec);
        assert!(matches!(
            factory.create(),
            Err(EngineError::Construction(_, _))
        ));
        assert_eq!(factory.instance_count(), 0);
    }

    #[test]
    fn test_last_script_repeats() {
        let adapter = SimulatedAdapter::new(
            SimBackendSpec::new(BackendId::new(1, Modality::Face))
                .with_script(vec![SimStep::after(0, SimEvent::Native { code: 3 })])
                .with_script(vec![SimStep::after(0, SimEvent::Success { token: None })]),
        );
        assert_eq!(adapter.script_for(0).len(), 1);
        assert!(matches!(adapter.script_for(5)[0].event, SimEvent::Success { .. }));
    }

    #[tokio::test]
    async fn test_flags_are_live() {
        let adapter = SimulatedAdapter::new(SimBackendSpec::new(BackendId::new(1, Modality::Face)));
        assert!(adapter.has_enrolled().await);
        adapter.set_enrolled(false);
        assert!(!adapter.has_enrolled().await);
        adapter.set_locked_out(true);
        assert!(adapter.is_locked_out().await);
    }
}

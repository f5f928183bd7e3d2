//! Biogate Engine - Backend orchestrator for biometric sensors
//!
//! This crate provides:
//! - The backend adapter contract and its cancellation signal
//! - A module registry replaced wholesale by a concurrent init pipeline
//! - Dynamic plugin loading through a provider lookup
//! - Single-flight dispatch with first-success-wins arbitration
//! - A debounced retry state machine and persistent lockout tracking
//! - A scripted simulated backend for tests and tooling

pub mod adapter;
pub mod classifier;
pub mod config;
pub mod dispatch;
mod driver;
pub mod error;
pub mod init;
pub mod listener;
pub mod lockout;
pub mod lockout_store;
pub mod orchestrator;
pub mod plugins;
pub mod registry;
pub mod sim;
pub mod timing;

pub use adapter::{AdapterFactory, AdapterSink, AttemptContext, BackendAdapter, CancelSignal, RawEvent};
pub use classifier::{Admission, AttemptState, Debouncer, RestartPredicate, RetryStateMachine, Step};
pub use config::EngineConfig;
pub use dispatch::{AuthOptions, AuthRequest, DispatchOutcome};
pub use error::{EngineError, Result};
pub use init::{ReadyEvent, ReadyListener, RegistryEvent};
pub use listener::{AuthEvent, AuthListener, FailureReport, RecordingListener};
pub use lockout::{Escalation, LockoutTracker};
pub use lockout_store::{FileLockoutStore, LockoutRecord, LockoutStore, MemoryLockoutStore};
pub use orchestrator::{Biogate, BiogateBuilder};
pub use plugins::{ProviderLookup, StaticProviders};
pub use registry::{ModuleRegistry, RegistryEntry, RegistrySnapshot};
pub use sim::{SimBackendSpec, SimEvent, SimStep, SimulatedAdapter, SimulatedFactory};
pub use timing::{AnimationTiming, DebounceTiming, FixedTiming, ANIMATION_SCALE_ENV};

//! Biogate Core - Shared vocabulary for the biometric backend orchestrator
//!
//! This crate provides the types that cross the adapter boundary: the
//! modality enum, backend identities, crypto purposes and the closed
//! failure taxonomy every native error is mapped into.

pub mod error;
pub mod failure;
pub mod modality;
pub mod types;

pub use error::{Error, Result};
pub use failure::{classify_native_code, CancelOrigin, FailureReason, NativeOutcome};
pub use modality::Modality;
pub use types::{BackendId, CryptoMode, CryptoObject, CryptoPurpose, ViewTarget};

/// Consecutive escalating failures before a modality is permanently locked
pub const DEFAULT_LOCKOUT_THRESHOLD: u32 = 5;

/// Bounded wait for the first registry publication (milliseconds)
pub const DEFAULT_READY_WAIT_TIMEOUT_MS: u64 = 5_000;

/// Poll interval while waiting for the first registry publication (milliseconds)
pub const DEFAULT_READY_POLL_INTERVAL_MS: u64 = 100;

/// Per-probe timeout during initialization (milliseconds)
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 10_000;

/// Base animation duration the debounce window is scaled from (milliseconds)
pub const DEFAULT_ANIMATION_BASE_MS: u64 = 250;

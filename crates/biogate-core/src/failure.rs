//! Closed failure taxonomy and native error-code classification
//!
//! `FailureReason` is the only failure vocabulary that crosses the adapter
//! boundary. Adapters translate whatever their native stack reports into it,
//! typically through [`classify_native_code`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Why an authentication attempt (or one adapter within it) failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// No backend for the requested modality exists on this device
    NoHardware,
    /// Backend exists but cannot be used right now
    HardwareUnavailable,
    /// Backend exists but nothing is enrolled
    NoBiometricsRegistered,
    /// Sensor could not process the sample
    SensorFailed,
    /// Locked out, either by the backend or by the orchestrator
    LockedOut,
    /// Backend gave up waiting for the user
    Timeout,
    /// Sample was processed and did not match
    AuthenticationFailed,
    Unknown,
    InternalError,
    /// Registry was not ready in time
    NotInitialized,
    MissingPermissions,
}

impl FailureReason {
    pub const ALL: [FailureReason; 11] = [
        FailureReason::NoHardware,
        FailureReason::HardwareUnavailable,
        FailureReason::NoBiometricsRegistered,
        FailureReason::SensorFailed,
        FailureReason::LockedOut,
        FailureReason::Timeout,
        FailureReason::AuthenticationFailed,
        FailureReason::Unknown,
        FailureReason::InternalError,
        FailureReason::NotInitialized,
        FailureReason::MissingPermissions,
    ];

    /// Reasons that count towards permanent lockout when not retried
    pub fn escalates(&self) -> bool {
        matches!(
            self,
            FailureReason::SensorFailed | FailureReason::AuthenticationFailed
        )
    }

    pub fn key(&self) -> &'static str {
        match self {
            FailureReason::NoHardware => "NO_HARDWARE",
            FailureReason::HardwareUnavailable => "HARDWARE_UNAVAILABLE",
            FailureReason::NoBiometricsRegistered => "NO_BIOMETRICS_REGISTERED",
            FailureReason::SensorFailed => "SENSOR_FAILED",
            FailureReason::LockedOut => "LOCKED_OUT",
            FailureReason::Timeout => "TIMEOUT",
            FailureReason::AuthenticationFailed => "AUTHENTICATION_FAILED",
            FailureReason::Unknown => "UNKNOWN",
            FailureReason::InternalError => "INTERNAL_ERROR",
            FailureReason::NotInitialized => "NOT_INITIALIZED",
            FailureReason::MissingPermissions => "MISSING_PERMISSIONS",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FailureReason::NoHardware => "No biometric hardware available",
            FailureReason::HardwareUnavailable => "Biometric hardware is currently unavailable",
            FailureReason::NoBiometricsRegistered => "No biometrics enrolled",
            FailureReason::SensorFailed => "Sensor failed to process the sample",
            FailureReason::LockedOut => "Too many attempts, biometric is locked",
            FailureReason::Timeout => "Authentication timed out",
            FailureReason::AuthenticationFailed => "Biometric not recognized",
            FailureReason::Unknown => "Unknown biometric error",
            FailureReason::InternalError => "Internal error",
            FailureReason::NotInitialized => "Biometric backends are not initialized",
            FailureReason::MissingPermissions => "Missing permission to use biometrics",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for FailureReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        FailureReason::ALL
            .into_iter()
            .find(|reason| reason.key() == normalized)
            .ok_or_else(|| Error::UnknownFailureReason(s.to_string()))
    }
}

/// Who explicitly canceled an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOrigin {
    /// User dismissed the prompt
    User,
    /// User pressed the negative ("use password") button
    NegativeButton,
}

/// A native error code after classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeOutcome {
    Failure(FailureReason),
    Canceled(CancelOrigin),
}

/// Platform biometric-prompt error codes
pub mod native {
    pub const HW_UNAVAILABLE: i32 = 1;
    pub const UNABLE_TO_PROCESS: i32 = 2;
    pub const TIMEOUT: i32 = 3;
    pub const NO_SPACE: i32 = 4;
    pub const CANCELED: i32 = 5;
    pub const LOCKOUT: i32 = 7;
    pub const VENDOR: i32 = 8;
    pub const LOCKOUT_PERMANENT: i32 = 9;
    pub const USER_CANCELED: i32 = 10;
    pub const NO_BIOMETRICS: i32 = 11;
    pub const HW_NOT_PRESENT: i32 = 12;
    pub const NEGATIVE_BUTTON: i32 = 13;
    pub const NO_DEVICE_CREDENTIAL: i32 = 14;
    pub const SECURITY_UPDATE_REQUIRED: i32 = 15;
}

/// Map a platform error code into the closed taxonomy
///
/// A system-initiated cancel (code 5) means the sensor was taken away from
/// us, so it is a hardware availability problem rather than a user cancel.
pub fn classify_native_code(code: i32) -> NativeOutcome {
    use FailureReason::*;

    match code {
        native::HW_UNAVAILABLE => NativeOutcome::Failure(HardwareUnavailable),
        native::UNABLE_TO_PROCESS | native::NO_SPACE => NativeOutcome::Failure(SensorFailed),
        native::TIMEOUT => NativeOutcome::Failure(Timeout),
        native::CANCELED => NativeOutcome::Failure(HardwareUnavailable),
        native::LOCKOUT | native::LOCKOUT_PERMANENT => NativeOutcome::Failure(LockedOut),
        native::USER_CANCELED => NativeOutcome::Canceled(CancelOrigin::User),
        native::NO_BIOMETRICS | native::NO_DEVICE_CREDENTIAL => {
            NativeOutcome::Failure(NoBiometricsRegistered)
        }
        native::HW_NOT_PRESENT => NativeOutcome::Failure(NoHardware),
        native::NEGATIVE_BUTTON => NativeOutcome::Canceled(CancelOrigin::NegativeButton),
        native::SECURITY_UPDATE_REQUIRED => NativeOutcome::Failure(HardwareUnavailable),
        _ => NativeOutcome::Failure(Unknown),
    }
}

//! Backend identities and crypto purpose types

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::modality::Modality;

/// Identity of one backend: priority-ordered id plus its modality
///
/// Lower ids win when several backends share a modality. Ordering is by id
/// first so a sorted collection of identities is in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendId {
    pub id: u32,
    pub modality: Modality,
}

impl BackendId {
    pub const fn new(id: u32, modality: Modality) -> Self {
        Self { id, modality }
    }
}

impl Ord for BackendId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id
            .cmp(&other.id)
            .then_with(|| self.modality.cmp(&other.modality))
    }
}

impl PartialOrd for BackendId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.id, self.modality.key())
    }
}

/// Parses `"<id>:<modality>"`, e.g. `"10:face"`
impl FromStr for BackendId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_start_matches('#');
        let (id, modality) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidBackendId(s.to_string()))?;
        let id = id
            .parse::<u32>()
            .map_err(|_| Error::InvalidBackendId(s.to_string()))?;
        let modality = modality.parse::<Modality>()?;
        if modality.is_any() {
            return Err(Error::InvalidBackendId(format!(
                "{}: a backend must have a concrete modality",
                s
            )));
        }
        Ok(Self { id, modality })
    }
}

/// Direction of the crypto operation bound to an authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CryptoMode {
    #[default]
    Encrypt,
    Decrypt,
}

/// Crypto purpose shared by every adapter started for one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CryptoPurpose {
    pub mode: CryptoMode,
    /// Initialization vector, required by most decrypt flows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<Vec<u8>>,
}

impl CryptoPurpose {
    pub fn encrypt() -> Self {
        Self {
            mode: CryptoMode::Encrypt,
            iv: None,
        }
    }

    pub fn decrypt(iv: Vec<u8>) -> Self {
        Self {
            mode: CryptoMode::Decrypt,
            iv: Some(iv),
        }
    }
}

/// Crypto result handed back with a successful authentication
///
/// The token is opaque to the orchestrator; validating it is the
/// adapter's and the platform's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoObject {
    pub purpose: CryptoPurpose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Vec<u8>>,
}

impl CryptoObject {
    pub fn new(purpose: CryptoPurpose, token: Option<Vec<u8>>) -> Self {
        Self { purpose, token }
    }
}

/// Opaque handle to the caller's presentation surface
///
/// Some adapters (camera based face backends) need to attach to a view.
/// The orchestrator only carries it through.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewTarget(pub String);

//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use biogate_core::{
    DEFAULT_ANIMATION_BASE_MS, DEFAULT_LOCKOUT_THRESHOLD, DEFAULT_PROBE_TIMEOUT_MS,
    DEFAULT_READY_POLL_INTERVAL_MS, DEFAULT_READY_WAIT_TIMEOUT_MS,
};

use crate::error::EngineError;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Consecutive escalating failures per modality before permanent lockout
    pub lockout_threshold: u32,

    /// How long a queued attempt waits for the first registry (milliseconds)
    pub ready_wait_timeout_ms: u64,

    /// Poll interval while waiting for the first registry (milliseconds)
    pub ready_poll_interval_ms: u64,

    /// A probe slower than this is treated as absent (milliseconds)
    pub probe_timeout_ms: u64,

    /// Base animation duration, scaled at runtime into the debounce window
    pub animation_base_ms: u64,

    /// File backing the persisted permanent-lockout flags
    pub lockout_store_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lockout_threshold: DEFAULT_LOCKOUT_THRESHOLD,
            ready_wait_timeout_ms: DEFAULT_READY_WAIT_TIMEOUT_MS,
            ready_poll_interval_ms: DEFAULT_READY_POLL_INTERVAL_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            animation_base_ms: DEFAULT_ANIMATION_BASE_MS,
            lockout_store_path: Self::default_lockout_store_path(),
        }
    }
}

impl EngineConfig {
    fn default_lockout_store_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("biogate")
            .join("lockout.json")
    }

    pub fn ready_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_wait_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn animation_base(&self) -> Duration {
        Duration::from_millis(self.animation_base_ms)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.lockout_threshold == 0 {
            return Err(EngineError::Config(
                "lockout_threshold must be at least 1".to_string(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(EngineError::Config(
                "probe_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create directories if they don't exist
    pub fn ensure_directories(&self) -> crate::Result<()> {
        if let Some(parent) = self.lockout_store_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.lockout_threshold, 5);
        assert_eq!(config.ready_wait_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");

        let config = EngineConfig {
            lockout_threshold: 3,
            lockout_store_path: dir.path().join("lockout.json"),
            ..EngineConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.lockout_threshold, 3);
        assert_eq!(loaded.lockout_store_path, dir.path().join("lockout.json"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "probe_timeout_ms": 250 }"#).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.probe_timeout(), Duration::from_millis(250));
        assert_eq!(loaded.lockout_threshold, 5);
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "lockout_threshold": 0 }"#).unwrap();

        assert!(matches!(
            EngineConfig::load(&path),
            Err(EngineError::Config(_))
        ));
    }
}

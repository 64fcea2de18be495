use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid sync configuration: {0}")]
    Invalid(String),
}

/// Tunables for the queue and the sync engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Queue capacity. Capture is rejected once reached; nothing is evicted.
    pub max_entries: usize,
    pub max_photo_bytes: usize,
    /// Automatic attempts before a record needs officer attention.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_max_ms: u64,
    pub sync_interval_ms: u64,
    /// Idempotency keys remembered after delivery, to skip replays.
    pub delivered_cache_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_photo_bytes: 10 * 1024 * 1024,
            max_attempts: 8,
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            jitter_max_ms: 1_000,
            sync_interval_ms: 30_000,
            delivered_cache_size: 1_024,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::Invalid("max_entries must be > 0".into()));
        }
        if self.max_photo_bytes == 0 {
            return Err(ConfigError::Invalid("max_photo_bytes must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be > 0".into()));
        }
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::Invalid("base_backoff_ms must be > 0".into()));
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(ConfigError::Invalid(
                "max_backoff_ms must be >= base_backoff_ms".into(),
            ));
        }
        if self.sync_interval_ms < 1_000 {
            return Err(ConfigError::Invalid(
                "sync_interval_ms should be at least 1000ms".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let bad = SyncConfig {
            max_entries: 0,
            ..SyncConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = SyncConfig {
            max_backoff_ms: 10,
            base_backoff_ms: 100,
            ..SyncConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = SyncConfig {
            sync_interval_ms: 5,
            ..SyncConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: SyncConfig = serde_json::from_str(r#"{"max_attempts": 3}"#).unwrap();
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.max_entries, SyncConfig::default().max_entries);
    }
}

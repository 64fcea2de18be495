use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sipatrol_shared::SyncConfig;
use thiserror::Error;

const API_URL_ENV: &str = "SIPATROL_API_URL";
const API_TOKEN_ENV: &str = "SIPATROL_API_TOKEN";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("could not locate the home directory")]
    NoHomeDir,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Sync(#[from] sipatrol_shared::ConfigError),
}

/// Shell settings. Missing file means defaults; environment wins over file.
#[derive(Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub api_base_url: String,
    pub api_token: Option<SecretString>,
    pub data_dir: Option<PathBuf>,
    pub request_timeout_secs: u64,
    pub probe_interval_secs: u64,
    /// 64 hex chars. When set, queued reports are sealed at rest.
    pub encryption_key_hex: Option<SecretString>,
    /// Bound into the sealing AAD so one officer's queue cannot be opened
    /// under another's account.
    pub officer_id: Option<String>,
    pub sync: SyncConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".into(),
            api_token: None,
            data_dir: None,
            request_timeout_secs: 30,
            probe_interval_secs: 15,
            encryption_key_hex: None,
            officer_id: None,
            sync: SyncConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, AppConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| AppConfigError::Read {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&content).map_err(|source| AppConfigError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Result<PathBuf, AppConfigError> {
        let home = dirs::home_dir().ok_or(AppConfigError::NoHomeDir)?;
        Ok(home.join(".config").join("sipatrol").join("config.json"))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(API_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.api_base_url = url;
        }
        if let Some(token) = lookup(API_TOKEN_ENV).filter(|v| !v.trim().is_empty()) {
            self.api_token = Some(SecretString::new(token));
        }
    }

    pub fn validate(&self) -> Result<(), AppConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(AppConfigError::Invalid("api_base_url is empty".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(AppConfigError::Invalid("request_timeout_secs must be > 0".into()));
        }
        if self.probe_interval_secs == 0 {
            return Err(AppConfigError::Invalid("probe_interval_secs must be > 0".into()));
        }
        self.sync.validate()?;
        Ok(())
    }

    /// Where the queue database lives.
    pub fn data_dir(&self) -> Result<PathBuf, AppConfigError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_local_dir()
            .map(|d| d.join("sipatrol"))
            .ok_or(AppConfigError::NoHomeDir)
    }

    pub fn api_token(&self) -> Option<SecretString> {
        self.api_token
            .as_ref()
            .map(|t| SecretString::new(t.expose_secret().clone()))
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_base_url", &self.api_base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("data_dir", &self.data_dir)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("probe_interval_secs", &self.probe_interval_secs)
            .field("sealed", &self.encryption_key_hex.is_some())
            .field("officer_id", &self.officer_id)
            .field("sync", &self.sync)
            .finish()
    }
}

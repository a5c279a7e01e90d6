//! Vault configuration
//!
//! Read from `~/.secretum/config.json` when it exists. Every field has a
//! default, so a partial file only overrides what it names.

use secretum_crypto::Algorithm;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const ENV_DATABASE: &str = "SECRETUM_DB";
pub const ENV_CLEAR_AFTER: &str = "SECRETUM_CLEAR_AFTER";

/// Longest exposure window accepted: one day
pub const MAX_CLEAR_AFTER_SECS: u64 = 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No home directory")]
    NoHome,

    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config.json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// `~/.secretum`
pub fn secretum_home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".secretum"))
        .ok_or(ConfigError::NoHome)
}

fn default_service() -> String {
    "secretum".to_string()
}

fn default_key_alias() -> String {
    "secretum-master-key".to_string()
}

fn default_database() -> PathBuf {
    secretum_home()
        .unwrap_or_else(|_| PathBuf::from(".secretum"))
        .join("secrets.db")
}

fn default_clear_after() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Keyring service name the master key is filed under
    #[serde(default = "default_service")]
    pub service: String,

    #[serde(default = "default_key_alias")]
    pub key_alias: String,

    #[serde(default)]
    pub algorithm: Algorithm,

    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Exposure window for copied fields, in seconds
    #[serde(default = "default_clear_after")]
    pub clear_after_secs: u64,

    /// Start every session locked
    #[serde(default = "default_true")]
    pub lock_on_start: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            service: default_service(),
            key_alias: default_key_alias(),
            algorithm: Algorithm::default(),
            database: default_database(),
            clear_after_secs: default_clear_after(),
            lock_on_start: default_true(),
        }
    }
}

impl VaultConfig {
    /// Defaults, then `~/.secretum/config.json`, then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = secretum_home()?.join("config.json");
        let config = if path.exists() {
            Self::load_from(&path)?
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };

        config.with_overrides(|name| std::env::var(name).ok())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SECRETUM_DB` and `SECRETUM_CLEAR_AFTER` as looked up by `env`.
    pub fn with_overrides(mut self, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(database) = env(ENV_DATABASE).filter(|v| !v.trim().is_empty()) {
            self.database = PathBuf::from(database);
        }

        if let Some(raw) = env(ENV_CLEAR_AFTER) {
            self.clear_after_secs = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                field: "clear_after_secs",
                reason: format!("{} is not a number of seconds", raw),
            })?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clear_after_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "clear_after_secs",
                reason: "exposure window must be at least one second".to_string(),
            });
        }
        if self.clear_after_secs > MAX_CLEAR_AFTER_SECS {
            return Err(ConfigError::Invalid {
                field: "clear_after_secs",
                reason: format!("exposure window must be at most {} seconds", MAX_CLEAR_AFTER_SECS),
            });
        }
        if self.key_alias.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "key_alias",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn clear_after(&self) -> Duration {
        Duration::from_secs(self.clear_after_secs)
    }

    /// Where detached clears keep their per-slot token files
    pub fn state_dir(&self) -> PathBuf {
        self.database
            .parent()
            .map(|dir| dir.join("run"))
            .unwrap_or_else(|| PathBuf::from("run"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VaultConfig::default();
        assert_eq!(config.service, "secretum");
        assert_eq!(config.key_alias, "secretum-master-key");
        assert_eq!(config.algorithm, Algorithm::ChaCha20Poly1305);
        assert_eq!(config.clear_after(), Duration::from_secs(30));
        assert!(config.lock_on_start);
        assert!(config.database.ends_with("secrets.db"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "algorithm": "aes-256-gcm", "clear_after_secs": 45 }"#).unwrap();

        let config = VaultConfig::load_from(&path).unwrap();
        assert_eq!(config.algorithm, Algorithm::Aes256Gcm);
        assert_eq!(config.clear_after_secs, 45);
        assert_eq!(config.service, "secretum");
    }

    #[test]
    fn test_zero_window_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "clear_after_secs": 0 }"#).unwrap();

        assert!(matches!(
            VaultConfig::load_from(&path),
            Err(ConfigError::Invalid { field: "clear_after_secs", .. })
        ));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ clear_after_secs: ").unwrap();

        assert!(matches!(VaultConfig::load_from(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let config = VaultConfig::default()
            .with_overrides(|name| match name {
                ENV_DATABASE => Some("/tmp/vault.db".to_string()),
                ENV_CLEAR_AFTER => Some(" 10 ".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.database, PathBuf::from("/tmp/vault.db"));
        assert_eq!(config.clear_after(), Duration::from_secs(10));
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/run"));
    }

    #[test]
    fn test_bad_env_window_is_rejected() {
        let result = VaultConfig::default().with_overrides(|name| (name == ENV_CLEAR_AFTER).then(|| "soon".to_string()));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_oversized_window_is_rejected() {
        let result = VaultConfig::default()
            .with_overrides(|name| (name == ENV_CLEAR_AFTER).then(|| u64::MAX.to_string()));
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { field: "clear_after_secs", .. })
        ));

        let longest = VaultConfig::default()
            .with_overrides(|name| (name == ENV_CLEAR_AFTER).then(|| MAX_CLEAR_AFTER_SECS.to_string()))
            .unwrap();
        assert_eq!(longest.clear_after(), Duration::from_secs(MAX_CLEAR_AFTER_SECS));
    }
}

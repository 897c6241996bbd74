//! Configuration loading for the Margin client.
//!
//! Connection settings are required. Sync tuning lives under `[sync]` and
//! falls back to [`SyncConfig::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use margin_core::SyncConfig;
use serde::Deserialize;

pub const CONFIG_ENV_VAR: &str = "MARGIN_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub auth: AuthConfig,
    pub request_timeout_ms: u64,
    /// LMDB directory. Without one, drafts and cache live in memory only.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
    #[serde(default = "default_storage_max_mb")]
    pub storage_max_mb: usize,
    #[serde(default)]
    pub start_offline: bool,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub bearer_token: Option<String>,
}

fn default_storage_max_mb() -> usize {
    64
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or MARGIN_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.api_base_url.trim();
        if base.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if self.auth.api_key.is_none() && self.auth.bearer_token.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "auth",
                reason: "api_key or bearer_token must be provided".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self
            .storage_path
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            return Err(ConfigError::InvalidValue {
                field: "storage_path",
                reason: "must not be empty when set".to_string(),
            });
        }
        if self.storage_max_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "storage_max_mb",
                reason: "must be > 0".to_string(),
            });
        }
        if let Err(e) = self.sync.validate() {
            return Err(ConfigError::InvalidValue {
                field: "sync",
                reason: e.to_string(),
            });
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        api_base_url = "https://margin.example.com/"
        request_timeout_ms = 5000

        [auth]
        api_key = "secret"
    "#;

    #[test]
    fn test_minimal_config_uses_sync_defaults() {
        let config = ClientConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.storage_path, None);
        assert!(!config.start_offline);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_sync_section_overrides_defaults() {
        let toml = format!("{MINIMAL}\n[sync]\nautosave_delay_ms = 250\nmax_selection = 20\n");
        let config = ClientConfig::from_toml(&toml).unwrap();
        assert_eq!(config.sync.autosave_delay(), Duration::from_millis(250));
        assert_eq!(config.sync.max_selection, Some(20));
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let toml = r#"
            api_base_url = "https://margin.example.com"
            request_timeout_ms = 5000

            [auth]
        "#;
        let err = ClientConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "auth", .. }));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let toml = format!("{MINIMAL}\ntheme = \"dark\"\n");
        assert!(matches!(
            ClientConfig::from_toml(&toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_sync_values_rejected() {
        let toml = format!("{MINIMAL}\n[sync]\norder_gap = 1\n");
        let err = ClientConfig::from_toml(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "sync", .. }));
    }
}

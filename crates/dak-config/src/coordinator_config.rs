//! Coordinator configuration
//!
//! Loaded from `.dak-watch.toml` or the config directory. Every field has a
//! default, so a partial file only overrides what it names.

use crate::config_file::{self, ConfigError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Repository host to talk to
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub actions: ActionConfig,

    #[serde(default)]
    pub sso: SsoConfig,
}

/// Status polling cadence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Steady-state interval between fetches
    pub normal_interval_ms: u64,
    /// Interval used right after a user action
    pub intensive_interval_ms: u64,
    /// Fetches made at the intensive interval before reverting to normal
    pub intensive_ticks: u32,
}

/// Lifetime of transient action feedback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    pub success_expiry_ms: u64,
    pub failure_expiry_ms: u64,
}

/// Organization SSO authorization waits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsoConfig {
    /// Interval between retries of the blocked request
    pub poll_interval_ms: u64,
    /// Give up after this long
    pub timeout_ms: u64,
    /// No new wait for an organization this long after the user dismissed one
    pub dismiss_cooldown_ms: u64,
}

fn default_host() -> String {
    crate::DEFAULT_HOST.to_string()
}

/// Zero intervals would spin, clamp them to one millisecond
fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            polling: PollingConfig::default(),
            actions: ActionConfig::default(),
            sso: SsoConfig::default(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            normal_interval_ms: 30_000,
            intensive_interval_ms: 5_000,
            intensive_ticks: 6,
        }
    }
}

impl PollingConfig {
    pub fn normal_interval(&self) -> Duration {
        millis(self.normal_interval_ms)
    }

    pub fn intensive_interval(&self) -> Duration {
        millis(self.intensive_interval_ms)
    }
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            success_expiry_ms: 15_000,
            failure_expiry_ms: 8_000,
        }
    }
}

impl ActionConfig {
    pub fn success_expiry(&self) -> Duration {
        Duration::from_millis(self.success_expiry_ms)
    }

    pub fn failure_expiry(&self) -> Duration {
        Duration::from_millis(self.failure_expiry_ms)
    }
}

impl Default for SsoConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            timeout_ms: 5 * 60 * 1_000,
            dismiss_cooldown_ms: 60_000,
        }
    }
}

impl SsoConfig {
    pub fn poll_interval(&self) -> Duration {
        millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn dismiss_cooldown(&self) -> Duration {
        Duration::from_millis(self.dismiss_cooldown_ms)
    }
}

impl CoordinatorConfig {
    /// Load config from CWD first, then the config directory, or use defaults
    pub fn load() -> Self {
        if let Some((path, content)) = config_file::load_config_file() {
            match Self::parse(&content, &path) {
                Ok(config) => {
                    log::info!("Loaded coordinator config from {}", path.display());
                    return config;
                }
                Err(e) => {
                    log::warn!("{}", e);
                }
            }
        }

        log::debug!("Using default coordinator config");
        Self::default()
    }

    /// Load config from an explicit path
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = config_file::read(path)?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.host, "github.com");
        assert_eq!(config.polling.normal_interval(), Duration::from_secs(30));
        assert_eq!(config.polling.intensive_interval(), Duration::from_secs(5));
        assert_eq!(config.polling.intensive_ticks, 6);
        assert_eq!(config.actions.success_expiry(), Duration::from_millis(15_000));
        assert_eq!(config.actions.failure_expiry(), Duration::from_millis(8_000));
        assert_eq!(config.sso.timeout(), Duration::from_secs(300));
        assert_eq!(config.sso.dismiss_cooldown(), Duration::from_secs(60));
    }

    #[test]
    fn test_config_deserialize_partial() {
        let toml = r#"
            host = "ghe.example.com"

            [polling]
            intensive_ticks = 3
        "#;
        let config = CoordinatorConfig::parse(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.host, "ghe.example.com");
        assert_eq!(config.polling.intensive_ticks, 3);
        // Other fields should use defaults
        assert_eq!(config.polling.normal_interval_ms, 30_000);
        assert_eq!(config.actions, ActionConfig::default());
        assert_eq!(config.sso, SsoConfig::default());
    }

    #[test]
    fn test_config_parse_error_names_path() {
        let err = CoordinatorConfig::parse("polling = 5", Path::new("broken.toml")).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let polling = PollingConfig {
            normal_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(polling.normal_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_from_missing_path() {
        let err = CoordinatorConfig::from_path(Path::new("/nonexistent/dak.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

//! Engine configuration, read from TOML.
//!
//! Every field has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! [monitoring]
//! window_secs = 259200
//! post_completion_rollback_secs = 604800
//!
//! [selection]
//! approval_ttl_secs = 604800
//! blocked_ttl_secs = 1209600
//! executing_timeout_secs = 900
//! max_execution_attempts = 3
//! history_limit = 20
//!
//! [scheduler]
//! interval_secs = 60
//!
//! [plans.pro]
//! auto_execute = true
//! auto_execute_max_risk = "medium"
//! max_risk = "high"
//!
//! [storefront]
//! base_url = "https://storefront.internal"
//!
//! [server]
//! port = 8080
//! rate_limit = 60
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::authorization::PlanPolicy;
use crate::types::PlanTier;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// Errors loading or validating a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub monitoring: MonitoringConfig,
    pub selection: SelectionConfig,
    pub scheduler: SchedulerConfig,
    /// Per-tier overrides. Tiers not listed keep their defaults.
    pub plans: BTreeMap<PlanTier, PlanPolicy>,
    pub storefront: StorefrontConfig,
    pub server: ServerConfig,
}

/// `[monitoring]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitoringConfig {
    /// Upper bound on the observation window after execution.
    pub window_secs: u64,
    /// How long a completed move's snapshot is kept for rollback.
    /// 0 discards it at completion.
    pub post_completion_rollback_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            window_secs: 72 * HOUR,
            post_completion_rollback_secs: 7 * DAY,
        }
    }
}

/// `[selection]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelectionConfig {
    /// Ready and awaiting-approval moves expire after this long.
    pub approval_ttl_secs: u64,
    /// Blocked moves expire after this long.
    pub blocked_ttl_secs: u64,
    /// A move still `executing` after this long is abandoned: credits are
    /// refunded and the storefront is restored from its snapshot.
    pub executing_timeout_secs: u64,
    /// Failed storefront mutations before a blocked move is given up.
    pub max_execution_attempts: u32,
    /// Next moves retained per merchant.
    pub history_limit: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            approval_ttl_secs: 7 * DAY,
            blocked_ttl_secs: 14 * DAY,
            executing_timeout_secs: 15 * 60,
            max_execution_attempts: 3,
            history_limit: 20,
        }
    }
}

/// `[scheduler]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

/// `[storefront]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorefrontConfig {
    /// Base URL of the storefront platform API. Unset means the in-memory
    /// storefront is used.
    pub base_url: Option<String>,
    /// Pull opportunities and readiness from the platform instead of
    /// accepting pushed feeds.
    pub pull: bool,
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    /// Requests per minute per client IP.
    pub rate_limit: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            rate_limit: 60,
        }
    }
}

impl EngineConfig {
    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitoring.window_secs == 0 {
            return Err(ConfigError::Invalid(
                "monitoring.window_secs must be greater than 0".to_string(),
            ));
        }
        if self.selection.approval_ttl_secs == 0 || self.selection.blocked_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "selection TTLs must be greater than 0".to_string(),
            ));
        }
        if self.selection.executing_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "selection.executing_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.selection.max_execution_attempts == 0 {
            return Err(ConfigError::Invalid(
                "selection.max_execution_attempts must be at least 1".to_string(),
            ));
        }
        if self.selection.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "selection.history_limit must be at least 1".to_string(),
            ));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.interval_secs must be greater than 0".to_string(),
            ));
        }
        for (tier, policy) in &self.plans {
            if policy.auto_execute && policy.auto_execute_max_risk > policy.max_risk {
                return Err(ConfigError::Invalid(format!(
                    "plans.{}: auto_execute_max_risk {} exceeds max_risk {}",
                    tier, policy.auto_execute_max_risk, policy.max_risk
                )));
            }
        }
        if let Some(url) = &self.storefront.base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "storefront.base_url '{}' must be an http(s) URL",
                    url
                )));
            }
        }
        if self.storefront.pull && self.storefront.base_url.is_none() {
            return Err(ConfigError::Invalid(
                "storefront.pull requires storefront.base_url".to_string(),
            ));
        }
        Ok(())
    }

    pub fn monitoring_window(&self) -> Duration {
        seconds(self.monitoring.window_secs)
    }

    pub fn post_completion_retention(&self) -> Duration {
        seconds(self.monitoring.post_completion_rollback_secs)
    }

    pub fn approval_ttl(&self) -> Duration {
        seconds(self.selection.approval_ttl_secs)
    }

    pub fn blocked_ttl(&self) -> Duration {
        seconds(self.selection.blocked_ttl_secs)
    }

    pub fn executing_timeout(&self) -> Duration {
        seconds(self.selection.executing_timeout_secs)
    }

    pub fn scheduler_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.scheduler.interval_secs)
    }
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskLevel;

    #[test]
    fn empty_file_is_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.monitoring_window(), Duration::hours(72));
        assert_eq!(config.post_completion_retention(), Duration::days(7));
    }

    #[test]
    fn plan_override_parses() {
        let config = EngineConfig::from_toml_str(
            r#"
            [plans.starter]
            auto_execute = true
            auto_execute_max_risk = "low"
            max_risk = "medium"

            [monitoring]
            window_secs = 3600
            "#,
        )
        .unwrap();
        let starter = config.plans[&PlanTier::Starter];
        assert!(starter.auto_execute);
        assert_eq!(starter.max_risk, RiskLevel::Medium);
        assert_eq!(config.monitoring.window_secs, 3600);
        assert_eq!(config.monitoring.post_completion_rollback_secs, 7 * DAY);
    }

    #[test]
    fn zero_window_is_rejected() {
        let err = EngineConfig::from_toml_str("[monitoring]\nwindow_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("window_secs"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = EngineConfig::from_toml_str("[selection]\nmax_execution_attempts = 0\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn executing_timeout_defaults_and_must_be_positive() {
        let config = EngineConfig::default();
        assert_eq!(config.executing_timeout(), Duration::minutes(15));
        let err = EngineConfig::from_toml_str("[selection]\nexecuting_timeout_secs = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("executing_timeout_secs"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = EngineConfig::from_toml_str("[monitoring]\nwindow = 10\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn pull_requires_base_url() {
        let err = EngineConfig::from_toml_str("[storefront]\npull = true\n").unwrap_err();
        assert!(err.to_string().contains("base_url"));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nextmove.toml");
        std::fs::write(&path, "[server]\nport = 9090\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 9090);

        let missing = EngineConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}

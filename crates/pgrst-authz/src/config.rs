//! Authorization engine configuration.
//!
//! This module provides the configuration types for the decision engine:
//! which policy backend is active, where its source lives, resource limits
//! for the script sandbox, and hot-reload behaviour.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root authorization engine configuration.
///
/// # Example (TOML)
///
/// ```toml
/// [policy]
/// engine = "quickjs"
/// policy_path = "/etc/pgrst-authz/policy.js"
/// evaluation_timeout = "500ms"
///
/// [policy.quickjs]
/// pool_enabled = true
/// pool_size = 4
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthzConfig {
    /// Policy backend used to evaluate requests.
    pub engine: EngineKind,

    /// Location of the policy source. Required.
    pub policy_path: PathBuf,

    /// Deadline for a single authorization request.
    #[serde(with = "humantime_serde")]
    pub evaluation_timeout: Duration,

    /// QuickJS scripting configuration.
    pub quickjs: QuickJsConfig,

    /// Policy hot-reload configuration.
    pub reload: ReloadConfig,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            policy_path: PathBuf::new(),
            evaluation_timeout: Duration::from_secs(1),
            quickjs: QuickJsConfig::default(),
            reload: ReloadConfig::default(),
        }
    }
}

/// The available policy backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Declarative Rego rules.
    #[default]
    Rego,
    /// Cedar entity/capability policies.
    Cedar,
    /// Sandboxed JavaScript run in QuickJS.
    #[serde(alias = "js")]
    QuickJs,
}

impl EngineKind {
    /// Configuration name of the backend.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rego => "rego",
            Self::Cedar => "cedar",
            Self::QuickJs => "quickjs",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rego" | "opa" => Ok(Self::Rego),
            "cedar" => Ok(Self::Cedar),
            "quickjs" | "js" => Ok(Self::QuickJs),
            other => Err(ConfigError::InvalidValue(format!(
                "Invalid engine: '{}'. Must be rego, cedar, or quickjs",
                other
            ))),
        }
    }
}

/// QuickJS scripting engine configuration.
///
/// Controls resource limits and pooling for the QuickJS policy engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuickJsConfig {
    /// Memory limit in megabytes.
    pub memory_limit_mb: usize,

    /// Stack size limit in kilobytes.
    pub max_stack_size_kb: usize,

    /// Script execution timeout in milliseconds.
    pub timeout_ms: u64,

    /// Reuse runtimes from a bounded pool instead of creating one per request.
    pub pool_enabled: bool,

    /// Number of pooled runtimes.
    /// This is also the maximum number of concurrent script evaluations.
    pub pool_size: usize,

    /// Number of evaluations after which a pooled runtime is replaced.
    pub max_uses: u32,
}

impl Default for QuickJsConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 16,
            max_stack_size_kb: 256,
            timeout_ms: 100,
            pool_enabled: true,
            pool_size: num_cpus::get().max(1),
            max_uses: 500,
        }
    }
}

/// Policy hot-reload configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Quiet period before a burst of file events triggers a reload.
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,

    /// Maximum number of attempts per reload.
    pub max_retry_attempts: usize,

    /// Initial retry backoff. Doubles on each retry.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            max_retry_attempts: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl ReloadConfig {
    /// Create a configuration for testing with fast timeouts.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(20),
            max_retry_attempts: 2,
            retry_backoff: Duration::from_millis(5),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),
}

impl AuthzConfig {
    /// Create a configuration for the given engine and policy source.
    #[must_use]
    pub fn new(engine: EngineKind, policy_path: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            policy_path: policy_path.into(),
            ..Default::default()
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if no policy path is set, and
    /// `ConfigError::InvalidValue` if a limit is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.policy_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("policy_path".to_string()));
        }

        if self.evaluation_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "evaluation_timeout must be > 0".to_string(),
            ));
        }

        // QuickJS limits only matter when the script engine is selected
        if self.engine == EngineKind::QuickJs {
            if self.quickjs.memory_limit_mb == 0 {
                return Err(ConfigError::InvalidValue(
                    "QuickJS memory_limit_mb must be > 0".to_string(),
                ));
            }

            if self.quickjs.timeout_ms == 0 {
                return Err(ConfigError::InvalidValue(
                    "QuickJS timeout_ms must be > 0".to_string(),
                ));
            }

            if self.quickjs.pool_enabled && self.quickjs.pool_size == 0 {
                return Err(ConfigError::InvalidValue(
                    "QuickJS pool_size must be > 0".to_string(),
                ));
            }

            if self.quickjs.max_uses == 0 {
                return Err(ConfigError::InvalidValue(
                    "QuickJS max_uses must be > 0".to_string(),
                ));
            }
        }

        if self.reload.max_retry_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "reload max_retry_attempts must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AuthzConfig::default();
        assert_eq!(config.engine, EngineKind::Rego);
        assert_eq!(config.evaluation_timeout, Duration::from_secs(1));
        assert!(config.quickjs.pool_enabled);
        assert!(config.quickjs.pool_size >= 1);
    }

    #[test]
    fn test_missing_policy_path_fails_validation() {
        let config = AuthzConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
        assert!(err.to_string().contains("policy_path"));
    }

    #[test]
    fn test_valid_config() {
        let config = AuthzConfig::new(EngineKind::Cedar, "policy.cedar");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_quickjs_timeout_fails_validation() {
        let mut config = AuthzConfig::new(EngineKind::QuickJs, "policy.js");
        config.quickjs.timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_ms"));
    }

    #[test]
    fn test_zero_pool_size_only_matters_when_pooling() {
        let mut config = AuthzConfig::new(EngineKind::QuickJs, "policy.js");
        config.quickjs.pool_size = 0;
        assert!(config.validate().is_err());

        config.quickjs.pool_enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_quickjs_limits_ignored_for_other_engines() {
        let mut config = AuthzConfig::new(EngineKind::Rego, "authz.rego");
        config.quickjs.memory_limit_mb = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_kind_parsing() {
        assert_eq!("rego".parse::<EngineKind>().unwrap(), EngineKind::Rego);
        assert_eq!("OPA".parse::<EngineKind>().unwrap(), EngineKind::Rego);
        assert_eq!("cedar".parse::<EngineKind>().unwrap(), EngineKind::Cedar);
        assert_eq!("js".parse::<EngineKind>().unwrap(), EngineKind::QuickJs);
        assert!("v8".parse::<EngineKind>().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut config = AuthzConfig::new(EngineKind::QuickJs, "policy.js");
        config.evaluation_timeout = Duration::from_millis(250);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"engine\":\"quickjs\""));
        assert!(json.contains("\"evaluation_timeout\":\"250ms\""));

        let parsed: AuthzConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.engine, EngineKind::QuickJs);
        assert_eq!(parsed.evaluation_timeout, Duration::from_millis(250));
    }
}

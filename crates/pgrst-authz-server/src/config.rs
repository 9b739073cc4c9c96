use std::fmt;
use std::net::SocketAddr;

use pgrst_authz::AuthzConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Bearer token verification
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Policy engine configuration
    #[serde(default)]
    pub policy: AuthzConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if let Some(prefix) = &self.server.path_prefix
            && !prefix.is_empty()
            && !prefix.starts_with('/')
        {
            return Err("server.path_prefix must start with '/'".into());
        }
        // Auth validation
        if self.auth.hmac_secret.is_empty() {
            return Err("auth.hmac_secret is required".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Policy validation
        self.policy
            .validate()
            .map_err(|e| format!("policy config error: {e}"))?;
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prefix the proxy prepends to the original path, stripped before translation.
    #[serde(default)]
    pub path_prefix: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    3001
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path_prefix: None,
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Shared HMAC secret the bearer tokens are signed with.
    #[serde(default)]
    pub hmac_secret: String,
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("hmac_secret", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Values given on the command line. They win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub hmac_secret: Option<String>,
    pub policy_path: Option<String>,
    pub engine: Option<String>,
    pub pool_enabled: Option<bool>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

pub mod loader {
    use super::{AppConfig, ConfigOverrides};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// File read when no path is given.
    pub const DEFAULT_CONFIG_FILE: &str = "pgrst-authz.toml";

    pub fn load_config(
        path: Option<&str>,
        overrides: &ConfigOverrides,
    ) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if !pathbuf.exists() {
                    return Err(format!("config file {p} does not exist"));
                }
                builder = builder.add_source(File::from(pathbuf));
            }
            None => {
                // Try default root-level file
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., PGRST_AUTHZ__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("PGRST_AUTHZ")
                .try_parsing(true)
                .separator("__"),
        );
        builder = apply_overrides(builder, overrides)
            .map_err(|e| format!("config override error: {e}"))?;

        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        // Validate
        merged.validate()?;
        Ok(merged)
    }

    fn apply_overrides(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        overrides: &ConfigOverrides,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        builder
            .set_override_option("auth.hmac_secret", overrides.hmac_secret.clone())?
            .set_override_option("policy.policy_path", overrides.policy_path.clone())?
            .set_override_option("policy.engine", overrides.engine.clone())?
            .set_override_option("policy.quickjs.pool_enabled", overrides.pool_enabled)?
            .set_override_option("server.host", overrides.host.clone())?
            .set_override_option("server.port", overrides.port.map(i64::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgrst_authz::EngineKind;

    fn valid() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.auth.hmac_secret = "secret".into();
        cfg.policy.policy_path = "policy.rego".into();
        cfg
    }

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 3001);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.policy.engine, EngineKind::Rego);
        assert!(cfg.policy.quickjs.pool_enabled);
    }

    #[test]
    fn test_secret_is_required() {
        let mut cfg = valid();
        assert!(cfg.validate().is_ok());

        cfg.auth.hmac_secret.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("hmac_secret"));
    }

    #[test]
    fn test_policy_path_is_required() {
        let mut cfg = valid();
        cfg.policy.policy_path = Default::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("policy_path"));
    }

    #[test]
    fn test_secret_redacted_in_debug() {
        let cfg = valid();
        let printed = format!("{cfg:?}");
        assert!(printed.contains("[REDACTED]"));
        assert!(!printed.contains("\"secret\""));
    }

    #[test]
    fn test_invalid_prefix_and_level() {
        let mut cfg = valid();
        cfg.server.path_prefix = Some("authz".into());
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().is_err());
    }
}

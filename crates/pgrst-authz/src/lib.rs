//! # pgrst-authz
//!
//! Authorization decision engine for PostgREST-style APIs served behind a
//! reverse proxy.
//!
//! For every proxied request the engine:
//! - Verifies the bearer token against a shared HMAC secret
//! - Translates method, path and query string into the SQL-level intent
//! - Evaluates that intent against a hot-swappable policy
//!
//! ## Modules
//!
//! - [`config`] - Engine configuration
//! - [`token`] - Bearer token verification and test token minting
//! - [`policy`] - Decision input, policy backends, execution pool, hot reload
//! - [`service`] - The `check` entry point used by the transport
//!
//! ## Example
//!
//! ```ignore
//! use pgrst_authz::prelude::*;
//!
//! let evaluator = build_evaluator(&config)?;
//! let reload = config.reload.clone();
//! let loader = Arc::new(PolicyLoader::new(evaluator.clone(), &config.policy_path, reload));
//! loader.load_initial().await?;
//!
//! let service = DecisionService::new(evaluator, secret, config.evaluation_timeout);
//! let decision = service.check(&CheckRequest::new("GET", "/orders?select=id")).await;
//! ```

pub mod config;
pub mod error;
pub mod policy;
pub mod service;
pub mod token;

pub use config::{AuthzConfig, ConfigError, EngineKind, QuickJsConfig, ReloadConfig};
pub use error::AuthzError;
pub use policy::{
    CedarEvaluator, Decision, DecisionInput, ExecutionPool, Lease, LoaderState, PolicyEvaluator,
    PolicyLoader, PolicyWatcher, PoolError, PoolStats, QuickJsEvaluator, RegoEvaluator,
    ReloadStats, Resource, SqlMethod, WatcherError, WatcherHandle, build_evaluator, translate,
};
pub use service::{CheckRequest, DecisionService};
pub use token::{Claims, MintClaims, TokenError, extract_identity, mint_token, validate_token};

/// Type alias for authorization results.
pub type AuthzResult<T> = Result<T, AuthzError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use pgrst_authz::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthzResult;
    pub use crate::config::{AuthzConfig, ConfigError, EngineKind};
    pub use crate::error::AuthzError;
    pub use crate::policy::{
        Decision, DecisionInput, PolicyEvaluator, PolicyLoader, PolicyWatcher, WatcherHandle,
        build_evaluator, translate,
    };
    pub use crate::service::{CheckRequest, DecisionService};
    pub use crate::token::{MintClaims, mint_token};
}

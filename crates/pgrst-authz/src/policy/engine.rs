//! Policy evaluator contract.
//!
//! Every backend implements [`PolicyEvaluator`]: `load_policy` compiles raw
//! policy source and atomically installs it, `authz_request` evaluates the
//! installed policy against a [`DecisionInput`]. Backends keep their compiled
//! artifact behind an `ArcSwapOption`, so a reload never blocks an in-flight
//! evaluation and an evaluation always completes against the snapshot it
//! started with.
//!
//! # Example
//!
//! ```ignore
//! use pgrst_authz::policy::engine::build_evaluator;
//!
//! let evaluator = build_evaluator(&config)?;
//! evaluator.load_policy(&std::fs::read(&config.policy_path)?)?;
//!
//! let decision = evaluator.authz_request(&input).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::AuthzResult;
use crate::config::{AuthzConfig, EngineKind};
use crate::error::AuthzError;
use crate::policy::cedar::CedarEvaluator;
use crate::policy::input::DecisionInput;
use crate::policy::pool::PoolStats;
use crate::policy::quickjs::QuickJsEvaluator;
use crate::policy::rego::RegoEvaluator;

// =============================================================================
// Decision
// =============================================================================

/// Outcome of an authorization request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allow: bool,

    /// Why the request was denied, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Decision {
    /// An allow decision.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
        }
    }

    /// A deny decision with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: Some(reason.into()),
        }
    }

    /// A deny decision produced by the policy itself.
    #[must_use]
    pub fn denied_by_policy() -> Self {
        Self::deny("blocked by policy")
    }

    /// Map a policy verdict onto a decision.
    #[must_use]
    pub fn from_verdict(allowed: bool) -> Self {
        if allowed {
            Self::allow()
        } else {
            Self::denied_by_policy()
        }
    }

    /// Returns `true` if access was granted.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.allow
    }
}

// =============================================================================
// Evaluator Trait
// =============================================================================

/// A pluggable policy backend.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> EngineKind;

    /// Compile `raw` and install it as the active policy.
    ///
    /// # Errors
    ///
    /// Returns `AuthzError::Compile` if the source is invalid. The previously
    /// installed policy stays active.
    fn load_policy(&self, raw: &[u8]) -> AuthzResult<()>;

    /// Evaluate the active policy against `input`.
    ///
    /// # Errors
    ///
    /// Returns `AuthzError::NotLoaded` before the first successful load and
    /// `AuthzError::Evaluation` if the backend fails.
    async fn authz_request(&self, input: &DecisionInput) -> AuthzResult<Decision>;

    /// Evaluate with the evaluation itself bounded by `deadline`.
    ///
    /// Waiting for an execution context does not count against the
    /// deadline. Backends that pool contexts override this to start the
    /// clock once the lease is held; the default bounds the whole call.
    ///
    /// # Errors
    ///
    /// Same as [`authz_request`](Self::authz_request), plus
    /// `AuthzError::Timeout` when the deadline passes.
    async fn authz_request_within(
        &self,
        input: &DecisionInput,
        deadline: Duration,
    ) -> AuthzResult<Decision> {
        match tokio::time::timeout(deadline, self.authz_request(input)).await {
            Ok(result) => result,
            Err(_) => Err(AuthzError::timeout(deadline)),
        }
    }

    /// Returns `true` once a policy has been installed.
    fn is_loaded(&self) -> bool;

    /// Execution pool statistics, for backends that pool execution contexts.
    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }
}

/// Build the evaluator selected by `config.engine`.
///
/// No policy is installed yet; the caller loads one before serving.
///
/// # Errors
///
/// Returns `AuthzError::Configuration` if `config` is invalid, or an error
/// if the backend cannot be initialized (for example if the QuickJS pool
/// fails to create its runtimes).
pub fn build_evaluator(config: &AuthzConfig) -> AuthzResult<Arc<dyn PolicyEvaluator>> {
    config
        .validate()
        .map_err(|e| AuthzError::configuration(e.to_string()))?;

    tracing::info!(engine = %config.engine, "Initializing policy engine");

    let evaluator: Arc<dyn PolicyEvaluator> = match config.engine {
        EngineKind::Rego => Arc::new(RegoEvaluator::new()),
        EngineKind::Cedar => Arc::new(CedarEvaluator::new()),
        EngineKind::QuickJs => Arc::new(QuickJsEvaluator::new(config.quickjs.clone())?),
    };
    Ok(evaluator)
}

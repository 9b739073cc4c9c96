//! Authorization error types.
//!
//! Every failure on the decision path is represented here. The decision
//! service turns all of them into a denial; only the loader surfaces them to
//! the operator.

/// Errors that can occur while loading or evaluating policies.
#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    /// The policy source could not be compiled by the active engine.
    #[error("Policy compile error: {message}")]
    Compile {
        /// Description of the compile failure.
        message: String,
    },

    /// The engine failed while evaluating a request.
    #[error("Policy evaluation error: {message}")]
    Evaluation {
        /// Description of the evaluation failure.
        message: String,
    },

    /// No policy has been installed yet.
    #[error("No policy loaded")]
    NotLoaded,

    /// Evaluation did not finish within its deadline.
    #[error("Policy evaluation timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline that was exceeded.
        timeout_ms: u64,
    },

    /// Reading the policy source failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// An execution context could not be provided.
    #[error("Execution pool error: {0}")]
    Pool(#[from] crate::policy::pool::PoolError),
}

impl AuthzError {
    /// Creates a new `Compile` error.
    #[must_use]
    pub fn compile(message: impl Into<String>) -> Self {
        Self::Compile {
            message: message.into(),
        }
    }

    /// Creates a new `Evaluation` error.
    #[must_use]
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a `Timeout` error for a deadline of `deadline`.
    #[must_use]
    pub fn timeout(deadline: std::time::Duration) -> Self {
        Self::Timeout {
            timeout_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns `true` if the error happened while installing a policy.
    #[must_use]
    pub fn is_load_error(&self) -> bool {
        matches!(self, Self::Compile { .. } | Self::Io(_))
    }

    /// Short machine-readable code used in denial reasons.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "compile-error",
            Self::Evaluation { .. } => "evaluation-error",
            Self::NotLoaded => "no-policy",
            Self::Timeout { .. } => "timeout",
            Self::Io(_) => "io-error",
            Self::Configuration { .. } => "configuration-error",
            Self::Pool(_) => "pool-error",
        }
    }
}

//! Policy loading and hot reload.
//!
//! [`PolicyLoader`] reads the policy source from disk and installs it into
//! the active evaluator. The initial load is fatal on failure; later reloads
//! retry with exponential backoff and, if every attempt fails, leave the
//! previously installed policy in place.
//!
//! # Example
//!
//! ```ignore
//! use pgrst_authz::policy::reload::PolicyLoader;
//!
//! let loader = Arc::new(PolicyLoader::new(evaluator, &config.policy_path, config.reload.clone()));
//! loader.load_initial().await?;
//!
//! // Later, e.g. from a file watcher
//! loader.reload().await;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::AuthzResult;
use crate::config::ReloadConfig;
use crate::policy::engine::PolicyEvaluator;

/// Whether a policy has been installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoaderState {
    /// No policy has been installed yet.
    Unloaded,
    /// A policy is active.
    Loaded,
}

/// Statistics about policy loading.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadStats {
    /// Total number of load attempts, retries included.
    pub reload_attempts: u64,
    /// Number of successful loads.
    pub successful_reloads: u64,
    /// Number of reloads that failed after all retries.
    pub failed_reloads: u64,
}

/// Loads the policy source into an evaluator.
pub struct PolicyLoader {
    evaluator: Arc<dyn PolicyEvaluator>,
    path: PathBuf,
    config: ReloadConfig,

    /// Serializes reloads so two bursts of file events never interleave.
    reload_lock: Mutex<()>,

    reload_attempts: AtomicU64,
    successful_reloads: AtomicU64,
    failed_reloads: AtomicU64,
}

impl PolicyLoader {
    /// Create a loader for the policy at `path`.
    #[must_use]
    pub fn new(
        evaluator: Arc<dyn PolicyEvaluator>,
        path: impl Into<PathBuf>,
        config: ReloadConfig,
    ) -> Self {
        Self {
            evaluator,
            path: path.into(),
            config,
            reload_lock: Mutex::new(()),
            reload_attempts: AtomicU64::new(0),
            successful_reloads: AtomicU64::new(0),
            failed_reloads: AtomicU64::new(0),
        }
    }

    /// Load the policy once, before serving.
    ///
    /// # Errors
    ///
    /// Returns `AuthzError::Io` if the file cannot be read and
    /// `AuthzError::Compile` if the source is rejected by the evaluator.
    pub async fn load_initial(&self) -> AuthzResult<()> {
        let _guard = self.reload_lock.lock().await;
        match self.load_once().await {
            Ok(()) => {
                tracing::info!(
                    path = %self.path.display(),
                    engine = %self.evaluator.kind(),
                    "Policy loaded"
                );
                Ok(())
            }
            Err(e) => {
                self.failed_reloads.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Reload the policy, retrying with exponential backoff.
    ///
    /// On final failure the active policy is left untouched and the last
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt if every attempt failed.
    pub async fn reload(&self) -> AuthzResult<()> {
        let _guard = self.reload_lock.lock().await;
        let mut attempts = 0;
        let mut backoff = self.config.retry_backoff;

        loop {
            match self.load_once().await {
                Ok(()) => {
                    tracing::info!(path = %self.path.display(), "Policy reloaded successfully");
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.max_retry_attempts {
                        self.failed_reloads.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            path = %self.path.display(),
                            error = %e,
                            attempts,
                            "Policy reload failed, keeping the active policy"
                        );
                        return Err(e);
                    }

                    tracing::warn!(
                        attempt = attempts,
                        max_attempts = self.config.max_retry_attempts,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Policy reload failed, retrying"
                    );

                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    async fn load_once(&self) -> AuthzResult<()> {
        self.reload_attempts.fetch_add(1, Ordering::Relaxed);
        let raw = tokio::fs::read(&self.path).await?;
        self.evaluator.load_policy(&raw)?;
        self.successful_reloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current loader state.
    #[must_use]
    pub fn state(&self) -> LoaderState {
        if self.evaluator.is_loaded() {
            LoaderState::Loaded
        } else {
            LoaderState::Unloaded
        }
    }

    /// Get reload statistics.
    #[must_use]
    pub fn stats(&self) -> ReloadStats {
        ReloadStats {
            reload_attempts: self.reload_attempts.load(Ordering::Relaxed),
            successful_reloads: self.successful_reloads.load(Ordering::Relaxed),
            failed_reloads: self.failed_reloads.load(Ordering::Relaxed),
        }
    }

    /// Path of the policy source.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The evaluator policies are installed into.
    #[must_use]
    pub fn evaluator(&self) -> &Arc<dyn PolicyEvaluator> {
        &self.evaluator
    }
}

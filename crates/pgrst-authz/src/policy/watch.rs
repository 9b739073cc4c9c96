//! Policy file watcher.
//!
//! Watches the policy source and triggers [`PolicyLoader::reload`] when it
//! changes. The parent directory is watched rather than the file itself so
//! that editors which save through a rename keep triggering reloads; events
//! for other files in the directory are ignored.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::policy::reload::PolicyLoader;

/// Errors that can occur while setting up the watcher.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Failed to initialize file watcher: {0}")]
    InitFailed(String),

    #[error("Failed to watch path {path}: {reason}")]
    WatchFailed { path: PathBuf, reason: String },
}

/// Watches a policy file and reloads it through a [`PolicyLoader`].
pub struct PolicyWatcher {
    loader: Arc<PolicyLoader>,
    debounce: Duration,
}

impl PolicyWatcher {
    #[must_use]
    pub fn new(loader: Arc<PolicyLoader>, debounce: Duration) -> Self {
        Self { loader, debounce }
    }

    /// Start watching. Must be called from within a tokio runtime.
    ///
    /// The watcher runs until the returned handle is stopped or dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS watcher cannot be created or the policy's
    /// directory cannot be watched.
    pub fn start(self) -> Result<WatcherHandle, WatcherError> {
        let path = self.loader.path().to_path_buf();
        let file_name = path.file_name().map(ToOwned::to_owned);
        let watch_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        // Capacity 1: a pending notification already covers later changes
        let (change_tx, mut change_rx) = mpsc::channel::<()>(1);

        let mut debouncer = new_debouncer(self.debounce, move |res: DebounceEventResult| {
            match res {
                Ok(events) => {
                    let touches_policy = events
                        .iter()
                        .any(|event| event.path.file_name() == file_name.as_deref());
                    if touches_policy {
                        let _ = change_tx.try_send(());
                    }
                }
                Err(e) => error!(error = ?e, "Policy watcher error"),
            }
        })
        .map_err(|e| WatcherError::InitFailed(e.to_string()))?;

        debouncer
            .watcher()
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::WatchFailed {
                path: watch_dir.clone(),
                reason: e.to_string(),
            })?;

        info!(path = %path.display(), "Started watching policy file");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let loader = self.loader;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("Policy watcher shutting down");
                        break;
                    }
                    changed = change_rx.recv() => {
                        if changed.is_none() {
                            break;
                        }
                        info!(path = %loader.path().display(), "Policy file changed, reloading");
                        // Failures are logged by the loader; the active policy stays
                        let _ = loader.reload().await;
                    }
                }
            }
        });

        Ok(WatcherHandle {
            _debouncer: debouncer,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
            path,
        })
    }
}

/// A handle to a running [`PolicyWatcher`].
///
/// Dropping the handle stops the OS watcher and signals the reload task.
pub struct WatcherHandle {
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
    path: PathBuf,
}

impl WatcherHandle {
    /// Path of the watched policy file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the watcher and wait for an in-flight reload to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReloadConfig;
    use crate::policy::engine::PolicyEvaluator;
    use crate::policy::input::translate;
    use crate::policy::rego::RegoEvaluator;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const ALLOW_ALL: &str = "package authz\n\nimport rego.v1\n\ndefault allow := true\n";
    const DENY_ALL: &str = "package authz\n\nimport rego.v1\n\ndefault allow := false\n";

    async fn allows(evaluator: &Arc<dyn PolicyEvaluator>) -> bool {
        let input = translate("GET", "/orders", &HashMap::new());
        evaluator.authz_request(&input).await.unwrap().is_allowed()
    }

    async fn wait_until<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn setup(dir: &TempDir) -> (Arc<PolicyLoader>, Arc<dyn PolicyEvaluator>, PathBuf) {
        let path = dir.path().join("authz.rego");
        std::fs::write(&path, ALLOW_ALL).unwrap();
        let evaluator: Arc<dyn PolicyEvaluator> = Arc::new(RegoEvaluator::new());
        let loader = Arc::new(PolicyLoader::new(
            Arc::clone(&evaluator),
            &path,
            ReloadConfig::for_testing(),
        ));
        (loader, evaluator, path)
    }

    #[tokio::test]
    async fn test_file_change_triggers_reload() {
        let dir = TempDir::new().unwrap();
        let (loader, evaluator, path) = setup(&dir);
        loader.load_initial().await.unwrap();
        assert!(allows(&evaluator).await);

        let handle = PolicyWatcher::new(Arc::clone(&loader), Duration::from_millis(20))
            .start()
            .unwrap();
        assert_eq!(handle.path(), path.as_path());

        std::fs::write(&path, DENY_ALL).unwrap();
        let evaluator = &evaluator;
        assert!(wait_until(|| async move { !allows(evaluator).await }).await);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_other_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let (loader, _evaluator, _path) = setup(&dir);
        loader.load_initial().await.unwrap();
        let before = loader.stats().reload_attempts;

        let handle = PolicyWatcher::new(Arc::clone(&loader), Duration::from_millis(20))
            .start()
            .unwrap();

        std::fs::write(dir.path().join("notes.txt"), "unrelated").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(loader.stats().reload_attempts, before);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_change_keeps_policy() {
        let dir = TempDir::new().unwrap();
        let (loader, evaluator, path) = setup(&dir);
        loader.load_initial().await.unwrap();

        let handle = PolicyWatcher::new(Arc::clone(&loader), Duration::from_millis(20))
            .start()
            .unwrap();

        std::fs::write(&path, "package authz\n\nallow if {{{").unwrap();
        let watched = &loader;
        assert!(wait_until(|| async move { watched.stats().failed_reloads > 0 }).await);
        assert!(allows(&evaluator).await);

        handle.stop().await;
    }
}

//! Pluggable policy engines.
//!
//! This module provides everything between a translated request and a
//! decision:
//!
//! - Request translation into the backend-neutral [`DecisionInput`]
//! - The [`PolicyEvaluator`] contract and its three backends
//! - The execution pool used by the script backend
//! - Policy loading and file-watch hot reload
//!
//! # Decision Input
//!
//! The [`input`] module maps an HTTP method, path and headers onto the SQL
//! intent PostgREST will execute:
//!
//! ```ignore
//! use pgrst_authz::policy::input::translate;
//!
//! let input = translate("GET", "/orders?select=id,total::numeric&status=eq.paid", &headers);
//! assert_eq!(input.resource.table(), "orders");
//! assert_eq!(input.select, vec!["id", "total"]);
//! ```
//!
//! # Backends
//!
//! | Engine   | Module     | Policy source                                 |
//! |----------|------------|-----------------------------------------------|
//! | Rego     | [`rego`]   | Rego module defining `data.authz.allow`       |
//! | Cedar    | [`cedar`]  | Cedar policy set over User/Table/Function     |
//! | QuickJS  | [`quickjs`]| JavaScript defining `handleRequest(input)`    |
//!
//! [`engine::build_evaluator`] selects one from configuration.
//!
//! # Hot Reload
//!
//! ```ignore
//! use pgrst_authz::policy::{PolicyLoader, PolicyWatcher};
//!
//! let loader = Arc::new(PolicyLoader::new(evaluator, path, config.reload.clone()));
//! loader.load_initial().await?;
//!
//! let watcher = PolicyWatcher::new(loader.clone(), config.reload.debounce).start()?;
//! ```
//!
//! [`DecisionInput`]: input::DecisionInput
//! [`PolicyEvaluator`]: engine::PolicyEvaluator

pub mod cedar;
pub mod engine;
pub mod input;
pub mod pool;
pub mod quickjs;
pub mod reload;
pub mod rego;
pub mod watch;

pub use cedar::CedarEvaluator;

pub use engine::{Decision, PolicyEvaluator, build_evaluator};

pub use input::{DecisionInput, Resource, SqlMethod, translate};

pub use pool::{ExecutionPool, Lease, PoolError, PoolStats};

pub use quickjs::QuickJsEvaluator;

pub use reload::{LoaderState, PolicyLoader, ReloadStats};

pub use rego::RegoEvaluator;

pub use watch::{PolicyWatcher, WatcherError, WatcherHandle};

use std::borrow::Cow;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
};
use pgrst_authz::{
    CheckRequest, DecisionService, EngineKind, LoaderState, PolicyLoader, PolicyWatcher,
    PoolStats, ReloadStats, WatcherHandle, build_evaluator,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;

pub const HEALTH_PATH: &str = "/_authz/health";
pub const STATS_PATH: &str = "/_authz/stats";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DecisionService>,
    pub loader: Arc<PolicyLoader>,
    pub path_prefix: Option<Arc<str>>,
}

/// Routes of the authorization service.
///
/// Every request outside `/_authz/` is an authorization check for the
/// original request the proxy forwarded: same method, path and headers.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(STATS_PATH, get(stats))
        .fallback(check)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn check(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let target = uri
        .path_and_query()
        .map_or_else(|| uri.path(), |pq| pq.as_str());
    let target = strip_path_prefix(target, state.path_prefix.as_deref());

    let request = CheckRequest::new(method.as_str(), target.as_ref()).with_headers(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );

    let decision = state.service.check(&request).await;
    let status = if decision.is_allowed() {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    };
    (status, Json(decision)).into_response()
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub engine: EngineKind,
    pub state: LoaderState,
    pub reload: ReloadStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStats>,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let evaluator = state.loader.evaluator();
    Json(StatsResponse {
        engine: evaluator.kind(),
        state: state.loader.state(),
        reload: state.loader.stats(),
        pool: evaluator.pool_stats(),
    })
}

/// Remove the proxy's path prefix, keeping a leading `/`.
fn strip_path_prefix<'a>(target: &'a str, prefix: Option<&str>) -> Cow<'a, str> {
    let prefix = match prefix.map(|p| p.trim_end_matches('/')) {
        Some(p) if !p.is_empty() => p,
        _ => return Cow::Borrowed(target),
    };
    match target.strip_prefix(prefix) {
        Some(rest) if rest.starts_with('/') => Cow::Borrowed(rest),
        Some(rest) if rest.is_empty() || rest.starts_with('?') => Cow::Owned(format!("/{rest}")),
        _ => Cow::Borrowed(target),
    }
}

pub struct ServerBuilder {
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Build the evaluator, load the policy and start watching it.
    ///
    /// Fails if the initial policy load fails: the service never serves
    /// without a policy.
    pub async fn build(self) -> anyhow::Result<AuthzServer> {
        let policy = &self.config.policy;

        let evaluator = build_evaluator(policy)?;
        let loader = Arc::new(PolicyLoader::new(
            Arc::clone(&evaluator),
            &policy.policy_path,
            policy.reload.clone(),
        ));
        loader.load_initial().await.with_context(|| {
            format!("failed to load policy from {}", policy.policy_path.display())
        })?;

        let watcher = PolicyWatcher::new(Arc::clone(&loader), policy.reload.debounce).start()?;

        let service = Arc::new(DecisionService::new(
            evaluator,
            self.config.auth.hmac_secret.as_bytes(),
            policy.evaluation_timeout,
        ));

        let state = AppState {
            service,
            loader,
            path_prefix: self.config.server.path_prefix.as_deref().map(Arc::from),
        };

        Ok(AuthzServer {
            addr: self.config.addr(),
            app: build_app(state),
            watcher,
        })
    }
}

pub struct AuthzServer {
    addr: SocketAddr,
    app: Router,
    watcher: WatcherHandle,
}

impl AuthzServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("listening on {}", listener.local_addr()?);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await?;
        self.watcher.stop().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

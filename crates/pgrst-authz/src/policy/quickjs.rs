//! QuickJS script evaluator.
//!
//! The policy source is a JavaScript program that defines a global
//! `handleRequest(input)` function. Its return value is coerced to a boolean
//! with JavaScript truthiness: `true`, non-zero numbers, non-empty strings
//! and objects allow the request.
//!
//! ```javascript
//! function handleRequest(input) {
//!   if (input.table === "public_items") return true;
//!   return input.jwt !== null && input.jwt.role === "admin";
//! }
//! ```
//!
//! # Design
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ QuickJsEvaluator (created once at startup)      │
//! │   ├── script: ArcSwapOption<ScriptUnit>         │
//! │   └── pool:   ExecutionPool<Runtime> (optional) │
//! └─────────────────────────────────────────────────┘
//!              │
//!              ▼ authz_request(input)
//! ┌─────────────────────────────────────────────────┐
//! │ Per-request (blocking thread):                  │
//! │   1. Lease a runtime (or build a fresh one)     │
//! │   2. Set interrupt handler for timeout          │
//! │   3. Create a fresh Context                     │
//! │   4. Install console, run the script            │
//! │   5. Call handleRequest(input)                  │
//! │   6. Clear interrupt handler, return runtime    │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! A new context per request means global state written by one request is
//! never visible to the next, even when they share a pooled runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use rquickjs::convert::Coerced;
use rquickjs::function::Rest;
use rquickjs::{Context, Ctx, Function, Object, Runtime, Value};

use crate::AuthzResult;
use crate::config::{EngineKind, QuickJsConfig};
use crate::error::AuthzError;
use crate::policy::engine::{Decision, PolicyEvaluator};
use crate::policy::input::DecisionInput;
use crate::policy::pool::{ExecutionPool, PoolError, PoolStats};

/// Name the script is reported under in load errors.
pub const SCRIPT_NAME: &str = "policy.js";

/// Global function invoked for every request.
pub const HANDLER_FN: &str = "handleRequest";

struct ScriptUnit {
    source: Arc<str>,
}

/// JavaScript policy backend.
pub struct QuickJsEvaluator {
    config: QuickJsConfig,
    script: ArcSwapOption<ScriptUnit>,
    pool: Option<Arc<ExecutionPool<Runtime>>>,
}

impl QuickJsEvaluator {
    /// Create the evaluator and, when pooling is enabled, its runtimes.
    ///
    /// # Errors
    ///
    /// Returns `AuthzError::Pool` if a runtime cannot be created.
    pub fn new(config: QuickJsConfig) -> AuthzResult<Self> {
        let pool = if config.pool_enabled {
            let limits = config.clone();
            let pool = ExecutionPool::new(config.pool_size, config.max_uses, move || {
                new_runtime(&limits)
            })?;
            tracing::info!(
                pool_size = config.pool_size,
                max_uses = config.max_uses,
                "QuickJS runtime pool initialized"
            );
            Some(pool)
        } else {
            None
        };

        Ok(Self {
            config,
            script: ArcSwapOption::empty(),
            pool,
        })
    }

    /// Compile `source` in a scratch runtime and check it defines the handler.
    fn check_script(&self, source: &str) -> AuthzResult<()> {
        let runtime = new_runtime(&self.config).map_err(|e| AuthzError::compile(e.to_string()))?;
        let outcome = with_deadline(&runtime, self.config.timeout_ms, |ctx| {
            setup_console(ctx)?;
            ctx.eval::<(), _>(source.as_bytes())?;
            let handler: Value = ctx.globals().get(HANDLER_FN)?;
            Ok(handler.is_function())
        });

        match outcome {
            Ok(true) => Ok(()),
            Ok(false) => Err(AuthzError::compile(format!(
                "{SCRIPT_NAME} must define a global function {HANDLER_FN}(input)"
            ))),
            Err(ScriptFailure::Timeout) => Err(AuthzError::compile(format!(
                "{SCRIPT_NAME} did not finish loading within {}ms",
                self.config.timeout_ms
            ))),
            Err(ScriptFailure::Error(message)) => Err(AuthzError::compile(message)),
        }
    }

    /// Run the handler. `deadline` starts once a runtime is held, so time
    /// queued behind a busy pool is latency, not a timeout.
    async fn evaluate(
        &self,
        input: &DecisionInput,
        deadline: Option<Duration>,
    ) -> AuthzResult<Decision> {
        let script = self.script.load_full().ok_or(AuthzError::NotLoaded)?;
        let source = Arc::clone(&script.source);
        let input_json = input.to_json().to_string();
        let timeout_ms = self.config.timeout_ms;

        let task = match &self.pool {
            Some(pool) => {
                let lease = pool.acquire().await?;
                tokio::task::spawn_blocking(move || {
                    let verdict = run_handler(&lease, &source, &input_json, timeout_ms);
                    lease.release();
                    verdict
                })
            }
            None => {
                let limits = self.config.clone();
                tokio::task::spawn_blocking(move || {
                    let runtime = new_runtime(&limits)?;
                    run_handler(&runtime, &source, &input_json, timeout_ms)
                })
            }
        };

        let joined = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, task)
                .await
                .map_err(|_| AuthzError::timeout(deadline))?,
            None => task.await,
        };
        let allowed =
            joined.map_err(|e| AuthzError::evaluation(format!("script task failed: {e}")))??;

        if !allowed {
            tracing::debug!(table = input.resource.table(), "Request blocked by script policy");
        }
        Ok(Decision::from_verdict(allowed))
    }
}

fn new_runtime(config: &QuickJsConfig) -> Result<Runtime, PoolError> {
    let runtime = Runtime::new().map_err(|e| PoolError::Create(e.to_string()))?;

    // Set memory limit (bytes)
    runtime.set_memory_limit(config.memory_limit_mb * 1024 * 1024);

    // Set stack limit (bytes)
    runtime.set_max_stack_size(config.max_stack_size_kb * 1024);

    Ok(runtime)
}

enum ScriptFailure {
    Timeout,
    Error(String),
}

impl ScriptFailure {
    fn into_authz_error(self, timeout_ms: u64) -> AuthzError {
        match self {
            Self::Timeout => AuthzError::Timeout { timeout_ms },
            Self::Error(message) => AuthzError::evaluation(message),
        }
    }
}

/// Run `f` in a fresh context of `runtime`, interrupting it after `timeout_ms`.
fn with_deadline<R: Send>(
    runtime: &Runtime,
    timeout_ms: u64,
    f: impl for<'js> FnOnce(&Ctx<'js>) -> rquickjs::Result<R> + Send,
) -> Result<R, ScriptFailure> {
    let start = Instant::now();
    let deadline = Duration::from_millis(timeout_ms);

    runtime.set_interrupt_handler(Some(Box::new(move || start.elapsed() > deadline)));

    let result = match Context::full(runtime) {
        Ok(context) => context.with(|ctx| f(&ctx).map_err(|e| describe_error(&ctx, e))),
        Err(e) => Err(e.to_string()),
    };

    runtime.set_interrupt_handler(None);

    result.map_err(|message| {
        if start.elapsed() > deadline {
            ScriptFailure::Timeout
        } else {
            ScriptFailure::Error(message)
        }
    })
}

/// Turn an rquickjs error into a message, pulling the pending exception if any.
fn describe_error(ctx: &Ctx<'_>, error: rquickjs::Error) -> String {
    if !error.is_exception() {
        return error.to_string();
    }

    let thrown = ctx.catch();
    if let Some(exception) = thrown.as_exception() {
        return exception
            .message()
            .unwrap_or_else(|| "uncaught exception".to_string());
    }
    if let Some(text) = thrown.as_string().and_then(|s| s.to_string().ok()) {
        return text;
    }
    format!("uncaught exception: {thrown:?}")
}

/// Setup console.log/warn/error, routed to the `quickjs` tracing target.
fn setup_console(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;

    console.set(
        "log",
        Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
            tracing::debug!(target: "quickjs", message = %join_args(args), "console.log");
        })?,
    )?;

    console.set(
        "warn",
        Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
            tracing::warn!(target: "quickjs", message = %join_args(args), "console.warn");
        })?,
    )?;

    console.set(
        "error",
        Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
            tracing::error!(target: "quickjs", message = %join_args(args), "console.error");
        })?,
    )?;

    ctx.globals().set("console", console)
}

fn join_args(args: Rest<Coerced<String>>) -> String {
    args.0
        .into_iter()
        .map(|arg| arg.0)
        .collect::<Vec<_>>()
        .join(" ")
}

/// JavaScript truthiness of a handler result.
fn is_truthy(value: &Value<'_>) -> bool {
    if let Some(b) = value.as_bool() {
        return b;
    }
    if let Some(i) = value.as_int() {
        return i != 0;
    }
    if let Some(f) = value.as_float() {
        return f != 0.0 && !f.is_nan();
    }
    if let Some(s) = value.as_string() {
        return s.to_string().map(|s| !s.is_empty()).unwrap_or(false);
    }
    !(value.is_null() || value.is_undefined())
}

fn run_handler(
    runtime: &Runtime,
    source: &str,
    input_json: &str,
    timeout_ms: u64,
) -> AuthzResult<bool> {
    with_deadline(runtime, timeout_ms, |ctx| {
        setup_console(ctx)?;
        ctx.eval::<(), _>(source.as_bytes())?;
        let handler: Function = ctx.globals().get(HANDLER_FN)?;
        let input = ctx.json_parse(input_json)?;
        let result: Value = handler.call((input,))?;
        Ok(is_truthy(&result))
    })
    .map_err(|failure| failure.into_authz_error(timeout_ms))
}

#[async_trait]
impl PolicyEvaluator for QuickJsEvaluator {
    fn kind(&self) -> EngineKind {
        EngineKind::QuickJs
    }

    fn load_policy(&self, raw: &[u8]) -> AuthzResult<()> {
        let source = std::str::from_utf8(raw)
            .map_err(|e| AuthzError::compile(format!("policy is not valid UTF-8: {e}")))?;
        self.check_script(source)?;
        self.script.store(Some(Arc::new(ScriptUnit {
            source: Arc::from(source),
        })));
        Ok(())
    }

    async fn authz_request(&self, input: &DecisionInput) -> AuthzResult<Decision> {
        self.evaluate(input, None).await
    }

    async fn authz_request_within(
        &self,
        input: &DecisionInput,
        deadline: Duration,
    ) -> AuthzResult<Decision> {
        self.evaluate(input, Some(deadline)).await
    }

    fn is_loaded(&self) -> bool {
        self.script.load().is_some()
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.as_ref().map(|pool| pool.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::input::translate;
    use std::collections::HashMap;

    const ADMIN_SCRIPT: &str = r#"
function handleRequest(input) {
  if (input.table === "public_items") return true;
  return input.jwt !== null && input.jwt.role === "admin";
}
"#;

    fn config(pool_enabled: bool) -> QuickJsConfig {
        QuickJsConfig {
            pool_enabled,
            pool_size: 2,
            max_uses: 3,
            timeout_ms: 200,
            ..Default::default()
        }
    }

    fn loaded(script: &str, pool_enabled: bool) -> QuickJsEvaluator {
        let evaluator = QuickJsEvaluator::new(config(pool_enabled)).unwrap();
        evaluator.load_policy(script.as_bytes()).unwrap();
        evaluator
    }

    fn input(method: &str, path: &str, role: Option<&str>) -> DecisionInput {
        let mut input = translate(method, path, &HashMap::new());
        input.identity = role.map(|role| {
            serde_json::json!({"id": "bar", "role": role})
                .as_object()
                .cloned()
                .unwrap()
        });
        input
    }

    #[tokio::test]
    async fn test_allow_and_deny() {
        for pool_enabled in [true, false] {
            let evaluator = loaded(ADMIN_SCRIPT, pool_enabled);

            let decision = evaluator
                .authz_request(&input("GET", "/orders", Some("admin")))
                .await
                .unwrap();
            assert!(decision.is_allowed());

            let decision = evaluator
                .authz_request(&input("GET", "/orders", None))
                .await
                .unwrap();
            assert!(!decision.is_allowed());

            let decision = evaluator
                .authz_request(&input("GET", "/public_items", None))
                .await
                .unwrap();
            assert!(decision.is_allowed());
        }
    }

    #[tokio::test]
    async fn test_truthiness() {
        let cases = [
            ("1", true),
            ("0", false),
            ("'yes'", true),
            ("''", false),
            ("({})", true),
            ("null", false),
            ("undefined", false),
            ("NaN", false),
            ("0.5", true),
        ];
        for (expr, expected) in cases {
            let script = format!("function handleRequest(input) {{ return {expr}; }}");
            let evaluator = loaded(&script, true);
            let decision = evaluator
                .authz_request(&input("GET", "/orders", None))
                .await
                .unwrap();
            assert_eq!(decision.is_allowed(), expected, "{expr}");
        }
    }

    #[tokio::test]
    async fn test_input_shape_visible_to_script() {
        let evaluator = loaded(
            r#"
function handleRequest(input) {
  return input.method === "UPDATE"
    && input.filters.id === "eq.1"
    && input.select.length === 0
    && input.path === "orders?id=eq.1";
}
"#,
            true,
        );
        let decision = evaluator
            .authz_request(&input("PATCH", "/orders?id=eq.1", None))
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn test_global_state_does_not_leak_between_requests() {
        let evaluator = loaded(
            r#"
var calls = 0;
function handleRequest(input) {
  calls += 1;
  return calls === 1;
}
"#,
            true,
        );
        for _ in 0..5 {
            let decision = evaluator
                .authz_request(&input("GET", "/orders", None))
                .await
                .unwrap();
            assert!(decision.is_allowed());
        }
    }

    #[tokio::test]
    async fn test_thrown_error_is_evaluation_error() {
        let evaluator = loaded(
            "function handleRequest(input) { throw new Error('no access'); }",
            true,
        );
        let err = evaluator
            .authz_request(&input("GET", "/orders", None))
            .await
            .unwrap_err();
        match err {
            AuthzError::Evaluation { message } => assert!(message.contains("no access")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_infinite_loop_times_out() {
        let evaluator = loaded("function handleRequest(input) { while (true) {} }", true);
        let err = evaluator
            .authz_request(&input("GET", "/orders", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::Timeout { timeout_ms: 200 }));

        // The runtime is still usable after an interrupt
        evaluator.load_policy(ADMIN_SCRIPT.as_bytes()).unwrap();
        let decision = evaluator
            .authz_request(&input("GET", "/public_items", None))
            .await
            .unwrap();
        assert!(decision.is_allowed());
    }

    #[test]
    fn test_load_rejects_bad_scripts() {
        let evaluator = QuickJsEvaluator::new(config(false)).unwrap();

        let err = evaluator.load_policy(b"function handleRequest( {").unwrap_err();
        assert!(matches!(err, AuthzError::Compile { .. }));

        let err = evaluator.load_policy(b"function other() { return true; }").unwrap_err();
        assert!(matches!(err, AuthzError::Compile { .. }));

        let err = evaluator.load_policy(b"var handleRequest = 42;").unwrap_err();
        assert!(matches!(err, AuthzError::Compile { .. }));

        assert!(!evaluator.is_loaded());
    }

    #[tokio::test]
    async fn test_not_loaded_is_error() {
        let evaluator = QuickJsEvaluator::new(config(true)).unwrap();
        let err = evaluator
            .authz_request(&input("GET", "/orders", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::NotLoaded));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_runtime_serializes_evaluations() {
        let evaluator = QuickJsEvaluator::new(QuickJsConfig {
            pool_size: 1,
            ..config(true)
        })
        .unwrap();
        evaluator
            .load_policy(
                br#"
function handleRequest(input) {
  const until = Date.now() + 60;
  while (Date.now() < until) {}
  return true;
}
"#,
            )
            .unwrap();

        let request = input("GET", "/orders", None);
        let start = Instant::now();
        let (first, second) = tokio::join!(
            evaluator.authz_request(&request),
            evaluator.authz_request(&request)
        );
        assert!(first.unwrap().is_allowed());
        assert!(second.unwrap().is_allowed());
        assert!(start.elapsed() >= Duration::from_millis(120));
        assert_eq!(evaluator.pool_stats().unwrap().acquisitions, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_in_flight_request_keeps_its_snapshot() {
        let evaluator = Arc::new(loaded(
            r#"
function handleRequest(input) {
  const until = Date.now() + 100;
  while (Date.now() < until) {}
  return true;
}
"#,
            true,
        ));

        let in_flight = {
            let evaluator = Arc::clone(&evaluator);
            tokio::spawn(async move {
                evaluator
                    .authz_request(&input("GET", "/orders", None))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        evaluator
            .load_policy(b"function handleRequest(input) { return false; }")
            .unwrap();

        assert!(in_flight.await.unwrap().unwrap().is_allowed());
        let decision = evaluator
            .authz_request(&input("GET", "/orders", None))
            .await
            .unwrap();
        assert!(!decision.is_allowed());
    }

    #[tokio::test]
    async fn test_pool_stats() {
        let evaluator = loaded(ADMIN_SCRIPT, true);
        for _ in 0..4 {
            evaluator
                .authz_request(&input("GET", "/orders", None))
                .await
                .unwrap();
        }

        let stats = evaluator.pool_stats().unwrap();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.available, 2);
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.acquisitions, 4);

        assert!(loaded(ADMIN_SCRIPT, false).pool_stats().is_none());
    }
}

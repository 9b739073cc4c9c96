//! Rego rule evaluator.
//!
//! The policy source is a Rego module that defines `data.authz.allow`. On
//! load the module is compiled into a prepared engine; each request clones
//! the prepared engine, sets the wire-form [`DecisionInput`] as `input`, and
//! reads the boolean rule. An undefined rule is a denial.
//!
//! ```rego
//! package authz
//!
//! import rego.v1
//!
//! default allow := false
//!
//! allow if {
//!     input.method == "SELECT"
//!     input.jwt.role == "admin"
//! }
//! ```

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use regorus::{Engine, Value};

use crate::AuthzResult;
use crate::config::EngineKind;
use crate::error::AuthzError;
use crate::policy::engine::{Decision, PolicyEvaluator};
use crate::policy::input::DecisionInput;

/// Rule queried for every request.
pub const ALLOW_RULE: &str = "data.authz.allow";

/// Module name the policy source is registered under.
const MODULE_NAME: &str = "authz.rego";

/// Rego policy backend.
pub struct RegoEvaluator {
    prepared: ArcSwapOption<Engine>,
}

impl RegoEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            prepared: ArcSwapOption::empty(),
        }
    }

    fn compile(source: &str) -> AuthzResult<Engine> {
        let mut engine = Engine::new();
        engine
            .add_policy(MODULE_NAME.to_string(), source.to_string())
            .map_err(|e| AuthzError::compile(e.to_string()))?;

        // Evaluating once against an empty input surfaces semantic errors
        // (unsafe variables, unknown functions) at load time.
        let mut trial = engine.clone();
        trial.set_input(Value::new_object());
        trial
            .eval_rule(ALLOW_RULE.to_string())
            .map_err(|e| AuthzError::compile(e.to_string()))?;

        Ok(engine)
    }

    fn evaluate(engine: &Engine, input: &DecisionInput) -> AuthzResult<bool> {
        let mut document = input.to_json();
        if document["jwt"].is_null() {
            document["jwt"] = serde_json::Value::Object(serde_json::Map::new());
        }

        let input_value = Value::from_json_str(&document.to_string())
            .map_err(|e| AuthzError::evaluation(e.to_string()))?;

        let mut engine = engine.clone();
        engine.set_input(input_value);

        match engine
            .eval_rule(ALLOW_RULE.to_string())
            .map_err(|e| AuthzError::evaluation(e.to_string()))?
        {
            Value::Bool(allowed) => Ok(allowed),
            Value::Undefined => Ok(false),
            other => Err(AuthzError::evaluation(format!(
                "{ALLOW_RULE} must be a boolean, got {other:?}"
            ))),
        }
    }
}

impl Default for RegoEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyEvaluator for RegoEvaluator {
    fn kind(&self) -> EngineKind {
        EngineKind::Rego
    }

    fn load_policy(&self, raw: &[u8]) -> AuthzResult<()> {
        let source = std::str::from_utf8(raw)
            .map_err(|e| AuthzError::compile(format!("policy is not valid UTF-8: {e}")))?;
        let engine = Self::compile(source)?;
        self.prepared.store(Some(Arc::new(engine)));
        Ok(())
    }

    async fn authz_request(&self, input: &DecisionInput) -> AuthzResult<Decision> {
        let engine = self.prepared.load_full().ok_or(AuthzError::NotLoaded)?;
        let allowed = Self::evaluate(&engine, input)?;
        if !allowed {
            tracing::debug!(table = input.resource.table(), "Request blocked by rego policy");
        }
        Ok(Decision::from_verdict(allowed))
    }

    fn is_loaded(&self) -> bool {
        self.prepared.load().is_some()
    }
}

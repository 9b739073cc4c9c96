//! Cedar entity evaluator.
//!
//! Each request is materialized into a small entity graph:
//!
//! ```text
//! User::"<jwt.id>"       attrs: every claim of the token          (principal)
//! Table::"<table>"       attrs: { columns: [select...] }          (resource)
//! Function::"<function>" attrs: { columns: [select...] }          (resource for rpc/)
//! Filters::"filters"     attrs: { filters: { key: value, ... } }
//! Action::"<METHOD>"                                              (action)
//! ```
//!
//! and the installed policy set is asked whether the principal may perform
//! the action on the resource.
//!
//! # Anonymous requests are allowed
//!
//! A request whose identity has no string `id` claim (no token, an invalid
//! token, or a token without `id`) is **allowed without consulting the
//! policy set**. Anonymous traffic is expected to be constrained by the
//! database role PostgREST switches to, not by this engine. Deployments that
//! need to deny anonymous requests must do so with a different backend.

use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use cedar_policy::{
    Authorizer, Context, Decision as CedarDecision, Entities, EntityId, EntityTypeName, EntityUid,
    PolicySet, Request, RestrictedExpression,
};
use serde_json::json;

use crate::AuthzResult;
use crate::config::EngineKind;
use crate::error::AuthzError;
use crate::policy::engine::{Decision, PolicyEvaluator};
use crate::policy::input::{DecisionInput, Resource};

/// Denial reason when the policy set fails to evaluate. Details are logged.
pub const POLICY_ERROR_REASON: &str = "policy-error";

/// Cedar policy backend.
pub struct CedarEvaluator {
    policies: ArcSwapOption<PolicySet>,
    authorizer: Authorizer,
}

impl CedarEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            policies: ArcSwapOption::empty(),
            authorizer: Authorizer::new(),
        }
    }

    fn evaluate(
        &self,
        policies: &PolicySet,
        input: &DecisionInput,
        principal: &str,
    ) -> AuthzResult<Decision> {
        let entities = build_entities(input, principal)?;

        let resource = match &input.resource {
            Resource::Table(name) => entity_uid("Table", name)?,
            Resource::Function(name) => entity_uid("Function", name)?,
        };
        let request = Request::new(
            entity_uid("User", principal)?,
            entity_uid("Action", input.method.as_str())?,
            resource,
            request_context()?,
            None,
        )
        .map_err(|e| AuthzError::evaluation(e.to_string()))?;

        let response = self.authorizer.is_authorized(&request, policies, &entities);
        if response.decision() == CedarDecision::Allow {
            return Ok(Decision::allow());
        }

        let errors: Vec<String> = response
            .diagnostics()
            .errors()
            .map(ToString::to_string)
            .collect();
        if errors.is_empty() {
            tracing::debug!(
                principal,
                resource = input.resource.name(),
                "Request blocked by cedar policy"
            );
            return Ok(Decision::denied_by_policy());
        }

        tracing::warn!(principal, errors = ?errors, "Cedar policy evaluation reported errors");
        Ok(Decision::deny(POLICY_ERROR_REASON))
    }
}

impl Default for CedarEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Request context. `context.demoRequest` is always `true`; existing
/// policy sets test it.
fn request_context() -> AuthzResult<Context> {
    Context::from_pairs([(
        "demoRequest".to_string(),
        RestrictedExpression::new_bool(true),
    )])
    .map_err(|e| AuthzError::evaluation(e.to_string()))
}

fn entity_uid(type_name: &str, id: &str) -> AuthzResult<EntityUid> {
    let type_name =
        EntityTypeName::from_str(type_name).map_err(|e| AuthzError::evaluation(e.to_string()))?;
    Ok(EntityUid::from_type_name_and_id(type_name, EntityId::new(id)))
}

fn build_entities(input: &DecisionInput, principal: &str) -> AuthzResult<Entities> {
    let claims = input.identity.clone().unwrap_or_default();
    let columns = json!({ "columns": input.select });

    let document = json!([
        {
            "uid": { "type": "User", "id": principal },
            "attrs": claims,
            "parents": []
        },
        {
            "uid": { "type": "Table", "id": input.resource.table() },
            "attrs": columns,
            "parents": []
        },
        {
            "uid": { "type": "Function", "id": input.resource.function() },
            "attrs": columns,
            "parents": []
        },
        {
            "uid": { "type": "Filters", "id": "filters" },
            "attrs": { "filters": input.filters },
            "parents": []
        }
    ]);

    Entities::from_json_value(document, None)
        .map_err(|e| AuthzError::evaluation(format!("invalid request entities: {e}")))
}

#[async_trait]
impl PolicyEvaluator for CedarEvaluator {
    fn kind(&self) -> EngineKind {
        EngineKind::Cedar
    }

    fn load_policy(&self, raw: &[u8]) -> AuthzResult<()> {
        let source = std::str::from_utf8(raw)
            .map_err(|e| AuthzError::compile(format!("policy is not valid UTF-8: {e}")))?;
        let policies = PolicySet::from_str(source).map_err(|e| AuthzError::compile(e.to_string()))?;
        self.policies.store(Some(Arc::new(policies)));
        Ok(())
    }

    async fn authz_request(&self, input: &DecisionInput) -> AuthzResult<Decision> {
        let policies = self.policies.load_full().ok_or(AuthzError::NotLoaded)?;

        let Some(principal) = input.principal_id() else {
            tracing::debug!(path = %input.path, "No principal id, allowing anonymous request");
            return Ok(Decision::allow());
        };

        self.evaluate(&policies, input, principal)
    }

    fn is_loaded(&self) -> bool {
        self.policies.load().is_some()
    }
}

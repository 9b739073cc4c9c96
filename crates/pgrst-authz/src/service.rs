//! Decision service.
//!
//! The request-facing entry point: verifies the bearer token, translates the
//! request and evaluates it against the active policy under a deadline.
//! Every failure on this path is a denial.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::policy::engine::{Decision, PolicyEvaluator};
use crate::policy::input::{DecisionInput, translate};
use crate::token::extract_identity;

/// Description of a proxied request.
#[derive(Debug, Clone, Default)]
pub struct CheckRequest {
    /// HTTP method, upper-case.
    pub method: String,
    /// Request target, path and query string.
    pub path: String,
    /// Headers keyed by lower-case name.
    pub headers: HashMap<String, String>,
}

impl CheckRequest {
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            headers: HashMap::new(),
        }
    }

    /// Add a header. Names are case-insensitive.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Add every header from `headers`.
    #[must_use]
    pub fn with_headers<'a>(
        mut self,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        for (name, value) in headers {
            self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        }
        self
    }
}

/// Wires identity extraction, translation and the active evaluator into a
/// single `check` operation.
pub struct DecisionService {
    evaluator: Arc<dyn PolicyEvaluator>,
    secret: Vec<u8>,
    timeout: Duration,
}

impl DecisionService {
    #[must_use]
    pub fn new(
        evaluator: Arc<dyn PolicyEvaluator>,
        secret: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Self {
        Self {
            evaluator,
            secret: secret.into(),
            timeout,
        }
    }

    /// Build the decision input for `request`, identity included.
    #[must_use]
    pub fn decision_input(&self, request: &CheckRequest) -> DecisionInput {
        let mut input = translate(&request.method, &request.path, &request.headers);
        input.identity = extract_identity(&request.headers, &self.secret);
        input
    }

    /// Decide whether `request` may proceed.
    ///
    /// Never fails: evaluation errors and timeouts are denials whose reason
    /// is the error code. The timeout bounds the evaluation only; waiting
    /// for a pooled execution context adds latency but never denies.
    pub async fn check(&self, request: &CheckRequest) -> Decision {
        let input = self.decision_input(request);

        let result = self
            .evaluator
            .authz_request_within(&input, self.timeout)
            .await;

        let decision = match result {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(
                    method = %request.method,
                    path = %request.path,
                    error = %e,
                    "Policy evaluation failed, denying request"
                );
                Decision::deny(e.code())
            }
        };

        if decision.allow {
            tracing::debug!(
                method = input.method.as_str(),
                resource = input.resource.name(),
                "Request allowed"
            );
        } else {
            tracing::info!(
                method = input.method.as_str(),
                resource = input.resource.name(),
                principal = input.principal_id().unwrap_or("anonymous"),
                reason = decision.reason.as_deref().unwrap_or_default(),
                "Request denied"
            );
        }

        decision
    }

    /// The active evaluator.
    #[must_use]
    pub fn evaluator(&self) -> &Arc<dyn PolicyEvaluator> {
        &self.evaluator
    }
}

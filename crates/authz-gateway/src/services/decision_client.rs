//! Policy decision client.
//!
//! Sends an authorization query to the external policy decision service
//! (OPA-compatible) and normalizes its verdict.
//!
//! # Security
//!
//! - A decision service failure is an error, never an implicit deny or allow
//! - Timeouts prevent hanging requests
//! - Failure details are logged server-side only

use crate::auth::claims::VerifiedClaims;
use crate::observability::metrics;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::instrument;

/// Default timeout for decision requests in seconds.
pub const DEFAULT_DECISION_TIMEOUT_SECS: u64 = 5;

/// How much the presented claims can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenTrust {
    /// Signature, issuer and audience were checked.
    Verified,
    /// Decoded without any check (development mode).
    Unverified,
}

/// Query sent to the policy as `{"input": query}`.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationQuery {
    /// Token claims, or null for anonymous requests.
    pub user: Option<VerifiedClaims>,

    /// Null when `user` is null.
    pub token_trust: Option<TokenTrust>,

    pub method: String,
    pub path: String,
    pub ip: String,
    pub headers: BTreeMap<String, String>,
}

impl AuthorizationQuery {
    pub fn new(
        user: Option<VerifiedClaims>,
        method: impl Into<String>,
        path: impl Into<String>,
        ip: impl Into<String>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        let token_trust = user.as_ref().map(|claims| {
            if claims.is_trusted() {
                TokenTrust::Verified
            } else {
                TokenTrust::Unverified
            }
        });

        Self {
            user,
            token_trust,
            method: method.into(),
            path: path.into(),
            ip: ip.into(),
            headers,
        }
    }
}

#[derive(Serialize)]
struct DecisionRequest<'a> {
    input: &'a AuthorizationQuery,
}

#[derive(Deserialize)]
struct DecisionResponse {
    #[serde(default)]
    result: Option<Value>,
}

/// Policy verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

/// Normalize a policy `result`: `true` or a non-empty array allows,
/// anything else (including absence) denies.
pub fn normalize_verdict(result: Option<&Value>) -> Decision {
    match result {
        Some(Value::Bool(true)) => Decision::Allow,
        Some(Value::Array(items)) if !items.is_empty() => Decision::Allow,
        _ => Decision::Deny,
    }
}

/// Decision service failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecisionError {
    /// Transport failure: connection refused, DNS, timeout.
    #[error("decision service unreachable: {0}")]
    Unreachable(String),

    /// Non-2xx status or a body that is not a decision document.
    #[error("decision service error: {0}")]
    ServiceError(String),
}

/// Something that can answer authorization queries.
#[async_trait::async_trait]
pub trait PolicyDecider: Send + Sync {
    async fn decide(&self, query: &AuthorizationQuery) -> Result<Decision, DecisionError>;
}

/// HTTP client for the policy decision endpoint.
#[derive(Clone)]
pub struct DecisionClient {
    client: Client,
    decision_url: String,
}

impl DecisionClient {
    pub fn new(decision_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5).min(timeout))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "gatehouse.services.decision", error = %e, "Failed to build HTTP client with custom config, using defaults");
                Client::new()
            });

        Self {
            client,
            decision_url: decision_url.into(),
        }
    }

    #[instrument(skip_all, fields(method = %query.method, path = %query.path))]
    async fn query(&self, query: &AuthorizationQuery) -> Result<Decision, DecisionError> {
        let response = self
            .client
            .post(&self.decision_url)
            .json(&DecisionRequest { input: query })
            .send()
            .await
            .map_err(|e| {
                tracing::error!(target: "gatehouse.services.decision", error = %e, "Decision request failed");
                DecisionError::Unreachable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(target: "gatehouse.services.decision", status = %status, "Decision service returned error status");
            return Err(DecisionError::ServiceError(format!("status {status}")));
        }

        let body: DecisionResponse = response.json().await.map_err(|e| {
            tracing::error!(target: "gatehouse.services.decision", error = %e, "Failed to parse decision response");
            DecisionError::ServiceError(format!("invalid response body: {e}"))
        })?;

        Ok(normalize_verdict(body.result.as_ref()))
    }
}

#[async_trait::async_trait]
impl PolicyDecider for DecisionClient {
    async fn decide(&self, query: &AuthorizationQuery) -> Result<Decision, DecisionError> {
        let start = Instant::now();
        let result = self.query(query).await;

        let outcome = match &result {
            Ok(Decision::Allow) => "allow",
            Ok(Decision::Deny) => "deny",
            Err(_) => "error",
        };
        metrics::record_decision(outcome, start.elapsed());
        tracing::debug!(target: "gatehouse.services.decision", outcome = outcome, "Policy decision");

        result
    }
}

/// Mock policy decider for testing.
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock decider returning a fixed outcome and recording queries.
    pub struct MockPolicyDecider {
        outcome: Result<Decision, DecisionError>,
        call_count: AtomicUsize,
        last_query: Mutex<Option<AuthorizationQuery>>,
    }

    impl MockPolicyDecider {
        pub fn allowing() -> Self {
            Self::with_outcome(Ok(Decision::Allow))
        }

        pub fn denying() -> Self {
            Self::with_outcome(Ok(Decision::Deny))
        }

        pub fn failing() -> Self {
            Self::with_outcome(Err(DecisionError::Unreachable(
                "mock decision service down".to_string(),
            )))
        }

        fn with_outcome(outcome: Result<Decision, DecisionError>) -> Self {
            Self {
                outcome,
                call_count: AtomicUsize::new(0),
                last_query: Mutex::new(None),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        pub fn last_query(&self) -> Option<AuthorizationQuery> {
            self.last_query.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl PolicyDecider for MockPolicyDecider {
        async fn decide(&self, query: &AuthorizationQuery) -> Result<Decision, DecisionError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            *self.last_query.lock() = Some(query.clone());
            self.outcome.clone()
        }
    }
}

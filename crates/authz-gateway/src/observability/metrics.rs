//! Metrics definitions for the authorization gateway.
//!
//! All metrics follow Prometheus naming conventions:
//! - `gatehouse_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `method`: HTTP methods only
//! - `endpoint`: the gateway's fixed routes, everything else is `/other`
//! - `status`: success, error, timeout
//! - `outcome`: bounded by code (verification results, decision verdicts)

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the global Prometheus recorder.
///
/// # Errors
///
/// Fails if bucket configuration is rejected or a global recorder is
/// already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Gateway overhead should stay well under a second
        .set_buckets_for_metric(
            Matcher::Prefix("gatehouse_http_request".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.200, 0.300, 0.500, 1.000, 2.000, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP request buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("gatehouse_decision".to_string()),
            &[0.001, 0.002, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000],
        )
        .map_err(|e| format!("Failed to set decision buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("gatehouse_downstream_request".to_string()),
            &[0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000],
        )
        .map_err(|e| format!("Failed to set downstream buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// HTTP Request Metrics
// ============================================================================

/// Record HTTP request completion
///
/// Metric: `gatehouse_http_requests_total`, `gatehouse_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status` / `status_code`
///
/// Captures every response, including 401/403 produced by the authorization
/// middleware and framework-level 404/405.
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let normalized_endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("gatehouse_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("gatehouse_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

/// Categorize HTTP status code into success/error/timeout
fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Map a request path onto the fixed route set.
fn normalize_endpoint(path: &str) -> &'static str {
    match path {
        "/" => "/",
        "/health" => "/health",
        "/metrics" => "/metrics",
        "/api/public" => "/api/public",
        "/api/protected" => "/api/protected",
        "/api/me" => "/api/me",
        _ => "/other",
    }
}

// ============================================================================
// Authentication / Authorization Metrics
// ============================================================================

/// Record a token verification result
///
/// Metric: `gatehouse_token_verifications_total`
/// Labels: `outcome` (success, expired, bad_signature, unverified, ...)
pub fn record_token_verification(outcome: &'static str) {
    counter!("gatehouse_token_verifications_total", "outcome" => outcome).increment(1);
}

/// Record a key-set fetch attempt
///
/// Metric: `gatehouse_jwks_fetches_total`
/// Labels: `outcome` (success, error, rate_limited)
pub fn record_jwks_fetch(outcome: &'static str) {
    counter!("gatehouse_jwks_fetches_total", "outcome" => outcome).increment(1);
}

/// Record a policy decision
///
/// Metric: `gatehouse_decisions_total`, `gatehouse_decision_duration_seconds`
/// Labels: `outcome` (allow, deny, error)
pub fn record_decision(outcome: &'static str, duration: Duration) {
    histogram!("gatehouse_decision_duration_seconds", "outcome" => outcome)
        .record(duration.as_secs_f64());
    counter!("gatehouse_decisions_total", "outcome" => outcome).increment(1);
}

// ============================================================================
// Delegation Metrics
// ============================================================================

/// Record an on-behalf-of exchange
///
/// Metric: `gatehouse_token_exchanges_total`
/// Labels: `outcome` (success, error)
pub fn record_token_exchange(outcome: &'static str) {
    counter!("gatehouse_token_exchanges_total", "outcome" => outcome).increment(1);
}

/// Record a downstream API call
///
/// Metric: `gatehouse_downstream_requests_total`, `gatehouse_downstream_request_duration_seconds`
/// Labels: `resource`, `status`
pub fn record_downstream_request(resource: &str, status_code: u16, duration: Duration) {
    let resource = normalize_downstream_resource(resource);
    let status = match status_code {
        404 => "not_found",
        other => categorize_status_code(other),
    };

    histogram!("gatehouse_downstream_request_duration_seconds", "resource" => resource)
        .record(duration.as_secs_f64());
    counter!("gatehouse_downstream_requests_total",
        "resource" => resource,
        "status" => status
    )
    .increment(1);
}

fn normalize_downstream_resource(path: &str) -> &'static str {
    match path {
        "/me" => "/me",
        "/me/manager" => "/me/manager",
        "/me/memberOf" => "/me/memberOf",
        "/organization" => "/organization",
        _ => "/other",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_record_http_request() {
        // No recorder installed: calls must be no-ops, not panics
        record_http_request("GET", "/api/protected", 200, Duration::from_millis(12));
        record_http_request("GET", "/api/protected", 401, Duration::from_millis(3));
        record_http_request("POST", "/does/not/exist", 404, Duration::from_millis(1));
    }

    #[test]
    fn test_record_auth_metrics() {
        record_token_verification("success");
        record_token_verification("expired");
        record_jwks_fetch("rate_limited");
        record_decision("allow", Duration::from_millis(4));
        record_token_exchange("error");
        record_downstream_request("/me/manager", 404, Duration::from_millis(30));
    }

    #[test]
    fn test_categorize_status_code() {
        assert_eq!(categorize_status_code(200), "success");
        assert_eq!(categorize_status_code(204), "success");
        assert_eq!(categorize_status_code(401), "error");
        assert_eq!(categorize_status_code(403), "error");
        assert_eq!(categorize_status_code(500), "error");
        assert_eq!(categorize_status_code(408), "timeout");
        assert_eq!(categorize_status_code(504), "timeout");
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("/health"), "/health");
        assert_eq!(normalize_endpoint("/api/me"), "/api/me");
        assert_eq!(normalize_endpoint("/api/protected"), "/api/protected");
        assert_eq!(normalize_endpoint("/api/protected/extra"), "/other");
        assert_eq!(normalize_endpoint("/wp-admin"), "/other");
    }

    #[test]
    fn test_normalize_downstream_resource() {
        assert_eq!(normalize_downstream_resource("/me/memberOf"), "/me/memberOf");
        assert_eq!(normalize_downstream_resource("/users/123"), "/other");
    }
}

//! Per-request authorization: verify the bearer token, then ask the policy.
//!
//! ```text
//! NoToken ──(allow-all?)──> Allowed
//!    │
//!    ├─ no bearer ─────────────────────────────┐
//!    └─ bearer ─> verify ─> Verified/Unverified ┴─> decide ─> Allowed | Denied | DecisionFailed
//!                   └──> RejectedToken (401, policy never consulted)
//! ```
//!
//! Authenticity and authorization are separate, sequential steps. An
//! anonymous request still reaches the policy, which may allow it.

use crate::auth::claims::{Authorization, VerifiedClaims};
use crate::auth::jwks::{KeyResolveError, KeyResolver, KeyResolverConfig};
use crate::auth::jwt::{PolicyError, TokenVerifier, VerificationPolicy, VerifyError};
use crate::config::Config;
use crate::services::decision_client::{
    AuthorizationQuery, DecisionClient, DecisionError, PolicyDecider,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// Request attributes forwarded to the policy.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub ip: String,
    pub headers: BTreeMap<String, String>,
}

/// Why a request was not authorized.
#[derive(Debug, Error)]
pub enum AuthorizeError {
    /// The presented token failed verification.
    #[error("invalid token: {0}")]
    InvalidToken(VerifyError),

    /// The key set could not be fetched, so no verdict on the token exists.
    #[error("key service failure: {0}")]
    KeyService(String),

    #[error("denied by policy")]
    Denied,

    #[error("policy decision failed: {0}")]
    DecisionFailed(DecisionError),
}

impl From<VerifyError> for AuthorizeError {
    fn from(err: VerifyError) -> Self {
        match err {
            VerifyError::Key(KeyResolveError::KeyFetch(reason)) => {
                AuthorizeError::KeyService(reason)
            }
            other => AuthorizeError::InvalidToken(other),
        }
    }
}

/// Extract a bearer token from an `Authorization` header value.
///
/// The scheme match is case-insensitive and the token is trimmed. Any other
/// scheme, or an empty token, counts as no token.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let header = header?;
    let scheme = header.get(..7)?;
    if !scheme.eq_ignore_ascii_case("bearer ") {
        return None;
    }
    header.get(7..).map(str::trim).filter(|token| !token.is_empty())
}

/// Authorization pipeline shared by every request.
pub struct Authorizer {
    verifier: TokenVerifier,
    decider: Arc<dyn PolicyDecider>,
    allow_all: bool,
}

impl Authorizer {
    pub fn new(verifier: TokenVerifier, decider: Arc<dyn PolicyDecider>, allow_all: bool) -> Self {
        if allow_all {
            tracing::warn!(
                target: "gatehouse.auth",
                "ALLOW_ALL is enabled; every request bypasses token verification and policy"
            );
        }
        Self {
            verifier,
            decider,
            allow_all,
        }
    }

    /// True when ALLOW_ALL bypasses verification and policy.
    pub fn allows_all(&self) -> bool {
        self.allow_all
    }

    /// Build the pipeline from gateway configuration.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError` if the verification settings are unusable.
    pub fn from_config(config: &Config) -> Result<Self, PolicyError> {
        let mut policy =
            VerificationPolicy::new(config.token_issuer.clone(), config.allowed_algorithms.clone())?
                .with_clock_skew(config.jwt_clock_skew)?
                .insecure_skip_verification(config.disable_jwt_validation);
        if let Some(audience) = &config.token_audience {
            policy = policy.with_audience(audience.clone());
        }

        let resolver = KeyResolver::new(
            KeyResolverConfig::new(config.jwks_url.clone())
                .with_max_entries(config.jwks_cache_max_entries)
                .with_ttl(config.jwks_cache_ttl)
                .with_rate_limit(config.jwks_requests_per_minute, Duration::from_secs(60)),
        );

        let decider = DecisionClient::new(config.decision_url.clone(), config.decision_timeout);

        Ok(Self::new(
            TokenVerifier::new(Arc::new(resolver), policy),
            Arc::new(decider),
            config.allow_all,
        ))
    }

    /// Authorize one request.
    ///
    /// # Errors
    ///
    /// - `InvalidToken` if a presented token fails verification (policy not consulted)
    /// - `KeyService` if the key set could not be fetched
    /// - `Denied` if the policy denies
    /// - `DecisionFailed` if the policy could not be consulted
    #[instrument(skip_all, fields(method = %ctx.method, path = %ctx.path))]
    pub async fn authorize(
        &self,
        authorization_header: Option<&str>,
        ctx: RequestContext,
    ) -> Result<Authorization, AuthorizeError> {
        if self.allow_all {
            tracing::warn!(
                target: "gatehouse.auth",
                method = %ctx.method,
                path = %ctx.path,
                "ALLOW_ALL bypass: request allowed without authentication or policy"
            );
            return Ok(Authorization { claims: None });
        }

        let claims: Option<VerifiedClaims> = match bearer_token(authorization_header) {
            Some(token) => Some(self.verifier.verify(token).await?),
            None => None,
        };

        let query = AuthorizationQuery::new(claims, ctx.method, ctx.path, ctx.ip, ctx.headers);
        let decision = self
            .decider
            .decide(&query)
            .await
            .map_err(AuthorizeError::DecisionFailed)?;

        if !decision.is_allowed() {
            tracing::info!(
                target: "gatehouse.auth",
                method = %query.method,
                path = %query.path,
                anonymous = query.user.is_none(),
                "Request denied by policy"
            );
            return Err(AuthorizeError::Denied);
        }

        Ok(Authorization { claims: query.user })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::services::decision_client::mock::MockPolicyDecider;
    use crate::services::decision_client::TokenTrust;
    use gateway_test_utils::{mount_jwks, TestKeypair, TokenBuilder};
    use jsonwebtoken::Algorithm;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ISSUER: &str = "https://login.example.com/tenant/v2.0";
    const AUDIENCE: &str = "api://gatehouse";

    struct Fixture {
        _server: MockServer,
        keypair: TestKeypair,
        decider: Arc<MockPolicyDecider>,
        authorizer: Authorizer,
    }

    async fn fixture(decider: MockPolicyDecider, insecure: bool) -> Fixture {
        let server = MockServer::start().await;
        let keypair = TestKeypair::new(5, "pipeline-key");
        let jwks_url = mount_jwks(&server, &[&keypair]).await;

        let policy = VerificationPolicy::new(ISSUER, [Algorithm::EdDSA])
            .unwrap()
            .with_audience(AUDIENCE)
            .insecure_skip_verification(insecure);
        let resolver = Arc::new(KeyResolver::new(KeyResolverConfig::new(jwks_url)));
        let decider = Arc::new(decider);

        Fixture {
            _server: server,
            keypair,
            decider: Arc::clone(&decider),
            authorizer: Authorizer::new(
                TokenVerifier::new(resolver, policy),
                decider as Arc<dyn PolicyDecider>,
                false,
            ),
        }
    }

    fn ctx() -> RequestContext {
        RequestContext {
            method: "GET".to_string(),
            path: "/api/protected".to_string(),
            ip: "10.1.2.3".to_string(),
            headers: BTreeMap::new(),
        }
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {token}")
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("BEARER   abc  ")), Some("abc"));
        assert_eq!(bearer_token(Some("Bearer ")), None);
        assert_eq!(bearer_token(Some("Bearer    ")), None);
        assert_eq!(bearer_token(Some("Basic dXNlcjpwYXNz")), None);
        assert_eq!(bearer_token(Some("Bearerabc")), None);
        assert_eq!(bearer_token(Some("Bear")), None);
        assert_eq!(bearer_token(None), None);
    }

    #[tokio::test]
    async fn test_valid_token_consults_policy_once() {
        let fx = fixture(MockPolicyDecider::allowing(), false).await;
        let token = TokenBuilder::new(ISSUER).audience(AUDIENCE).subject("u1").sign(&fx.keypair);

        let auth = fx
            .authorizer
            .authorize(Some(&bearer(&token)), ctx())
            .await
            .unwrap();

        assert_eq!(fx.decider.call_count(), 1);
        let claims = auth.claims.unwrap();
        assert_eq!(claims.subject(), Some("u1"));
        assert!(claims.is_trusted());

        let query = fx.decider.last_query().unwrap();
        assert_eq!(query.token_trust, Some(TokenTrust::Verified));
        assert_eq!(query.ip, "10.1.2.3");
        assert_eq!(query.path, "/api/protected");
    }

    #[tokio::test]
    async fn test_no_token_still_consults_policy() {
        let fx = fixture(MockPolicyDecider::allowing(), false).await;

        let auth = fx.authorizer.authorize(None, ctx()).await.unwrap();

        assert!(auth.claims.is_none());
        assert_eq!(fx.decider.call_count(), 1);
        let query = fx.decider.last_query().unwrap();
        assert!(query.user.is_none());
        assert!(query.token_trust.is_none());
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_is_anonymous() {
        let fx = fixture(MockPolicyDecider::allowing(), false).await;

        let auth = fx
            .authorizer
            .authorize(Some("Basic dXNlcjpwYXNz"), ctx())
            .await
            .unwrap();

        assert!(auth.claims.is_none());
        assert_eq!(fx.decider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_tokens_never_reach_policy() {
        let fx = fixture(MockPolicyDecider::allowing(), false).await;
        let expired = TokenBuilder::new(ISSUER)
            .audience(AUDIENCE)
            .expires_in(-3600)
            .sign(&fx.keypair);
        let wrong_issuer = TokenBuilder::new("https://other/v2.0")
            .audience(AUDIENCE)
            .sign(&fx.keypair);

        for token in [expired.as_str(), wrong_issuer.as_str(), "garbage", "a.b.c"] {
            let result = fx.authorizer.authorize(Some(&bearer(token)), ctx()).await;
            assert!(
                matches!(result, Err(AuthorizeError::InvalidToken(_))),
                "token {token:?} should be rejected"
            );
        }

        assert_eq!(fx.decider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_policy_deny_is_denied() {
        let fx = fixture(MockPolicyDecider::denying(), false).await;
        let token = TokenBuilder::new(ISSUER).audience(AUDIENCE).sign(&fx.keypair);

        let result = fx.authorizer.authorize(Some(&bearer(&token)), ctx()).await;

        assert!(matches!(result, Err(AuthorizeError::Denied)));
        assert_eq!(fx.decider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_policy_failure_is_not_deny() {
        let fx = fixture(MockPolicyDecider::failing(), false).await;

        let result = fx.authorizer.authorize(None, ctx()).await;

        assert!(matches!(result, Err(AuthorizeError::DecisionFailed(_))));
    }

    #[tokio::test]
    async fn test_insecure_mode_passes_unverified_claims_to_policy() {
        let fx = fixture(MockPolicyDecider::allowing(), true).await;
        let stranger = TestKeypair::new(42, "unknown-key");
        let token = TokenBuilder::new("https://anyone").subject("dev").sign(&stranger);

        let auth = fx
            .authorizer
            .authorize(Some(&bearer(&token)), ctx())
            .await
            .unwrap();

        assert!(!auth.claims.unwrap().is_trusted());
        let query = fx.decider.last_query().unwrap();
        assert_eq!(query.token_trust, Some(TokenTrust::Unverified));
        assert_eq!(fx.decider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_allow_all_skips_everything() {
        let server = MockServer::start().await;
        let policy = VerificationPolicy::new(ISSUER, [Algorithm::EdDSA]).unwrap();
        let resolver = Arc::new(KeyResolver::new(KeyResolverConfig::new(format!(
            "{}/keys",
            server.uri()
        ))));
        let decider = Arc::new(MockPolicyDecider::denying());
        let authorizer = Authorizer::new(
            TokenVerifier::new(resolver, policy),
            Arc::clone(&decider) as Arc<dyn PolicyDecider>,
            true,
        );

        let auth = authorizer
            .authorize(Some("Bearer not-even-a-jwt"), ctx())
            .await
            .unwrap();

        assert!(auth.claims.is_none());
        assert_eq!(decider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_key_set_outage_is_key_service_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let keypair = TestKeypair::new(5, "pipeline-key");
        let policy = VerificationPolicy::new(ISSUER, [Algorithm::EdDSA]).unwrap();
        let resolver = Arc::new(KeyResolver::new(KeyResolverConfig::new(format!(
            "{}/keys",
            server.uri()
        ))));
        let decider = Arc::new(MockPolicyDecider::allowing());
        let authorizer = Authorizer::new(
            TokenVerifier::new(resolver, policy),
            Arc::clone(&decider) as Arc<dyn PolicyDecider>,
            false,
        );

        let token = TokenBuilder::new(ISSUER).sign(&keypair);
        let result = authorizer.authorize(Some(&bearer(&token)), ctx()).await;

        assert!(matches!(result, Err(AuthorizeError::KeyService(_))));
        assert_eq!(decider.call_count(), 0);
    }
}

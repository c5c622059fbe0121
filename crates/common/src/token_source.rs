//! Session accounts and silent token re-acquisition.
//!
//! A [`TokenSource`] is whatever can mint a fresh access token for a signed-in
//! account without user interaction. The [`RefreshScheduler`] drives it; this
//! module supplies the trait, the account/token types that flow through it, and
//! [`RefreshTokenSource`], an OAuth 2.0 `refresh_token` grant client.
//!
//! [`RefreshScheduler`]: crate::refresh_scheduler::RefreshScheduler

use crate::jwt::read_expiry;
use crate::secret::{ExposeSecret, SecretString};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

/// Default HTTP request timeout for the token endpoint.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// OAuth error codes meaning the IdP wants the user back in the loop.
const INTERACTION_ERROR_CODES: [&str; 4] = [
    "invalid_grant",
    "interaction_required",
    "login_required",
    "consent_required",
];

// =============================================================================
// Error Types
// =============================================================================

/// Errors from token acquisition and the refresh scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Transport failure or server-side error from the token endpoint.
    #[error("HTTP client error: {0}")]
    HttpError(String),

    /// Client authentication rejected by the token endpoint.
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// Silent acquisition is impossible; the user must sign in again.
    #[error("User interaction required: {0}")]
    InteractionRequired(String),

    /// Token response parsing failed.
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The scheduler task is gone.
    #[error("Token channel closed")]
    ChannelClosed,
}

impl TokenError {
    /// Whether another silent attempt could plausibly succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::InteractionRequired(_) | Self::Configuration(_) | Self::ChannelClosed
        )
    }
}

// =============================================================================
// Accounts and Tokens
// =============================================================================

/// Stable identifier of a signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountKey(String);

impl AccountKey {
    /// Wrap an identifier as-is.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Pick the first non-empty identifier, in order of stability: the
    /// cross-tenant home account id, then the tenant-local id, then the
    /// username.
    #[must_use]
    pub fn from_identifiers(
        home_account_id: Option<&str>,
        local_account_id: Option<&str>,
        username: Option<&str>,
    ) -> Option<Self> {
        [home_account_id, local_account_id, username]
            .into_iter()
            .flatten()
            .find(|id| !id.is_empty())
            .map(Self::new)
    }

    /// Borrow the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A signed-in account as far as token refresh is concerned.
#[derive(Debug, Clone)]
pub struct SessionAccount {
    /// Identity key; one refresh schedule exists per key.
    pub key: AccountKey,

    /// Long-lived credential used for silent acquisition, if the session has one.
    pub refresh_credential: Option<SecretString>,
}

impl SessionAccount {
    #[must_use]
    pub fn new(key: AccountKey) -> Self {
        Self {
            key,
            refresh_credential: None,
        }
    }

    #[must_use]
    pub fn with_refresh_credential(mut self, credential: SecretString) -> Self {
        self.refresh_credential = Some(credential);
        self
    }
}

/// Result of a successful silent acquisition.
#[derive(Debug, Clone)]
pub struct AcquiredToken {
    /// The new access token.
    pub access_token: SecretString,

    /// Expiry reported by the token endpoint (Unix seconds), if any.
    pub expires_at: Option<i64>,

    /// Rotated refresh credential, when the IdP issued a new one.
    pub refresh_credential: Option<SecretString>,
}

impl AcquiredToken {
    #[must_use]
    pub fn new(access_token: SecretString) -> Self {
        Self {
            access_token,
            expires_at: None,
            refresh_credential: None,
        }
    }

    /// Expiry used for the next refresh: the token's own `exp` claim, falling
    /// back to the endpoint-reported lifetime for opaque tokens.
    #[must_use]
    pub fn expiry(&self) -> Option<i64> {
        read_expiry(self.access_token.expose_secret()).or(self.expires_at)
    }
}

/// Anything that can silently mint a fresh token for an account.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    /// Acquire a new token without user interaction.
    async fn acquire_silent(&self, account: &SessionAccount) -> Result<AcquiredToken, TokenError>;
}

// =============================================================================
// Refresh Token Source
// =============================================================================

/// Configuration for [`RefreshTokenSource`].
#[derive(Clone)]
pub struct RefreshTokenSourceConfig {
    /// Full token endpoint URL. **Should use HTTPS in production.**
    pub token_endpoint: String,

    /// OAuth client ID.
    pub client_id: String,

    /// Client secret for confidential clients; public clients leave it unset.
    pub client_secret: Option<SecretString>,

    /// Scopes requested on refresh.
    pub scopes: Vec<String>,

    /// HTTP request timeout.
    pub http_timeout: Duration,
}

impl fmt::Debug for RefreshTokenSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshTokenSourceConfig")
            .field("token_endpoint", &self.token_endpoint)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("scopes", &self.scopes)
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

impl RefreshTokenSourceConfig {
    #[must_use]
    pub fn new(token_endpoint: String, client_id: String) -> Self {
        Self {
            token_endpoint,
            client_id,
            client_secret: None,
            scopes: Vec::new(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_client_secret(mut self, secret: SecretString) -> Self {
        self.client_secret = Some(secret);
        self
    }

    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    #[must_use]
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }
}

/// Successful response from the token endpoint.
#[derive(Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Error response from the token endpoint (RFC 6749 section 5.2).
#[derive(Debug, Default, Deserialize)]
struct OAuthErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Silent acquisition via the OAuth 2.0 `refresh_token` grant.
pub struct RefreshTokenSource {
    config: RefreshTokenSourceConfig,
    http_client: reqwest::Client,
}

impl RefreshTokenSource {
    /// # Errors
    ///
    /// Returns `TokenError::Configuration` if the HTTP client cannot be built.
    pub fn new(config: RefreshTokenSourceConfig) -> Result<Self, TokenError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TokenError::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            http_client,
        })
    }
}

#[async_trait]
impl TokenSource for RefreshTokenSource {
    #[instrument(skip_all, fields(account = %account.key))]
    async fn acquire_silent(&self, account: &SessionAccount) -> Result<AcquiredToken, TokenError> {
        let Some(refresh_credential) = account.refresh_credential.as_ref() else {
            return Err(TokenError::InteractionRequired(
                "No refresh credential for account".to_string(),
            ));
        };

        debug!(
            target: "common.token_source",
            client_id = %self.config.client_id,
            url = %self.config.token_endpoint,
            "Requesting token via refresh grant"
        );

        let scope = self.config.scopes.join(" ");
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_credential.expose_secret()),
        ];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.expose_secret()));
        }

        let response = self
            .http_client
            .post(&self.config.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                debug!(target: "common.token_source", error = %e, "HTTP request failed");
                TokenError::HttpError(e.to_string())
            })?;

        let status = response.status();

        if status.is_success() {
            let body: OAuthTokenResponse = response.json().await.map_err(|e| {
                warn!(target: "common.token_source", error = %e, "Failed to parse token response");
                TokenError::InvalidResponse(e.to_string())
            })?;

            #[allow(clippy::cast_possible_wrap)]
            let expires_at = body
                .expires_in
                .map(|secs| chrono::Utc::now().timestamp() + secs as i64);

            debug!(
                target: "common.token_source",
                expires_in_secs = ?body.expires_in,
                rotated = body.refresh_token.is_some(),
                "Token acquired successfully"
            );

            Ok(AcquiredToken {
                access_token: SecretString::from(body.access_token),
                expires_at,
                refresh_credential: body.refresh_token.map(SecretString::from),
            })
        } else if status.as_u16() == 400 || status.as_u16() == 401 {
            let body = response.text().await.unwrap_or_else(|e| {
                trace!(target: "common.token_source", error = %e, "Failed to read error response body");
                String::new()
            });
            let oauth_error: OAuthErrorResponse = serde_json::from_str(&body).unwrap_or_default();
            trace!(
                target: "common.token_source",
                description = ?oauth_error.error_description,
                "Token endpoint rejection details"
            );

            if INTERACTION_ERROR_CODES.contains(&oauth_error.error.as_str()) {
                warn!(
                    target: "common.token_source",
                    status = %status,
                    error_code = %oauth_error.error,
                    "Silent acquisition requires user interaction"
                );
                Err(TokenError::InteractionRequired(oauth_error.error))
            } else {
                warn!(
                    target: "common.token_source",
                    status = %status,
                    "Authentication rejected by token endpoint"
                );
                Err(TokenError::AuthenticationRejected(format!("Status {status}")))
            }
        } else if status.is_server_error() {
            warn!(target: "common.token_source", status = %status, "Token endpoint server error");
            Err(TokenError::HttpError(format!("Server error: {status}")))
        } else {
            warn!(target: "common.token_source", status = %status, "Unexpected token endpoint response");
            Err(TokenError::HttpError(format!("Unexpected status: {status}")))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn source(base_url: &str) -> RefreshTokenSource {
        let config = RefreshTokenSourceConfig::new(
            format!("{base_url}/oauth2/v2.0/token"),
            "spa-client".to_string(),
        )
        .with_scopes(vec!["openid".to_string(), "profile".to_string()]);
        RefreshTokenSource::new(config).unwrap()
    }

    fn account() -> SessionAccount {
        SessionAccount::new(AccountKey::new("home-1"))
            .with_refresh_credential(SecretString::from("rt-original"))
    }

    #[test]
    fn test_account_key_prefers_home_then_local_then_username() {
        let key = AccountKey::from_identifiers(Some("home"), Some("local"), Some("user"));
        assert_eq!(key.unwrap().as_str(), "home");

        let key = AccountKey::from_identifiers(Some(""), Some("local"), Some("user"));
        assert_eq!(key.unwrap().as_str(), "local");

        let key = AccountKey::from_identifiers(None, None, Some("alice@example.com"));
        assert_eq!(key.unwrap().as_str(), "alice@example.com");

        assert!(AccountKey::from_identifiers(None, Some(""), None).is_none());
    }

    #[test]
    fn test_acquired_token_expiry_prefers_claim() {
        let payload = URL_SAFE_NO_PAD.encode(r#"{"exp":1800000000}"#);
        let mut token = AcquiredToken::new(SecretString::from(format!("h.{payload}.s")));
        token.expires_at = Some(1_700_000_000);
        assert_eq!(token.expiry(), Some(1_800_000_000));

        let mut opaque = AcquiredToken::new(SecretString::from("opaque"));
        assert_eq!(opaque.expiry(), None);
        opaque.expires_at = Some(1_700_000_000);
        assert_eq!(opaque.expiry(), Some(1_700_000_000));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TokenError::HttpError("x".into()).is_retryable());
        assert!(TokenError::AuthenticationRejected("x".into()).is_retryable());
        assert!(!TokenError::InteractionRequired("x".into()).is_retryable());
        assert!(!TokenError::Configuration("x".into()).is_retryable());
    }

    #[test]
    fn test_config_debug_redacts_secret() {
        let config = RefreshTokenSourceConfig::new("https://idp".into(), "client".into())
            .with_client_secret(SecretString::from("super-secret-value"));

        let debug_str = format!("{config:?}");
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("super-secret-value"));
    }

    #[tokio::test]
    async fn test_refresh_grant_success_rotates_credential() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-original"))
            .and(body_string_contains("scope=openid+profile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "rt-rotated"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let token = source(&mock_server.uri())
            .acquire_silent(&account())
            .await
            .unwrap();

        assert_eq!(token.access_token.expose_secret(), "new-access");
        assert_eq!(
            token.refresh_credential.unwrap().expose_secret(),
            "rt-rotated"
        );
        assert!(token.expires_at.unwrap() > chrono::Utc::now().timestamp());
    }

    #[tokio::test]
    async fn test_invalid_grant_maps_to_interaction_required() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "AADSTS70043: refresh token expired"
            })))
            .mount(&mock_server)
            .await;

        let result = source(&mock_server.uri()).acquire_silent(&account()).await;
        assert_eq!(
            result.unwrap_err(),
            TokenError::InteractionRequired("invalid_grant".to_string())
        );
    }

    #[tokio::test]
    async fn test_invalid_client_maps_to_authentication_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth2/v2.0/token"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(serde_json::json!({"error": "invalid_client"})),
            )
            .mount(&mock_server)
            .await;

        let result = source(&mock_server.uri()).acquire_silent(&account()).await;
        assert!(matches!(result, Err(TokenError::AuthenticationRejected(_))));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable_http_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let err = source(&mock_server.uri())
            .acquire_silent(&account())
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::HttpError(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_refresh_credential_requires_interaction() {
        let bare = SessionAccount::new(AccountKey::new("home-1"));
        let result = source("http://127.0.0.1:1").acquire_silent(&bare).await;
        assert!(matches!(result, Err(TokenError::InteractionRequired(_))));
    }
}

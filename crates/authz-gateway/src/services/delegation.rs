//! On-behalf-of token exchange.
//!
//! Trades the caller's verified access token for a token scoped to a
//! downstream API, using the OAuth 2.0 JWT bearer grant with
//! `requested_token_use=on_behalf_of`.
//!
//! # Security
//!
//! - Delegated tokens are exchanged fresh for every inbound call and never cached
//! - The client secret and both tokens are held as `SecretString`
//! - Identity provider error details are logged, not returned to callers

use crate::observability::metrics;
use common::secret::{ExposeSecret, SecretString};
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// Default timeout for token endpoint requests in seconds.
const EXCHANGE_TIMEOUT_SECS: u64 = 10;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Delegation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExchangeError {
    /// No inbound token to exchange.
    #[error("missing on-behalf-of assertion")]
    MissingAssertion,

    /// Client id or secret absent from configuration.
    #[error("client credentials not configured")]
    NotConfigured,

    /// The identity provider rejected the exchange or could not be reached.
    #[error("token exchange failed: {0}")]
    Failed(String),
}

/// Token obtained on the caller's behalf for a downstream API.
pub struct DelegatedToken {
    pub value: SecretString,
    pub scopes: Vec<String>,
    pub expires_in: Option<u64>,
}

impl fmt::Debug for DelegatedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedToken")
            .field("value", &"[REDACTED]")
            .field("scopes", &self.scopes)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Confidential client credentials for the exchange.
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: SecretString,
}

/// On-behalf-of exchanger.
#[derive(Clone)]
pub struct DelegationExchanger {
    client: Client,
    token_url: String,
    credentials: Option<ClientCredentials>,
}

impl DelegationExchanger {
    /// Create an exchanger for the given authority.
    ///
    /// `credentials` may be `None`; every exchange then fails with
    /// `NotConfigured` instead of reaching the identity provider.
    pub fn new(authority: &str, credentials: Option<ClientCredentials>) -> Self {
        if credentials.is_none() {
            tracing::warn!(
                target: "gatehouse.services.delegation",
                "CLIENT_ID or CLIENT_SECRET not set: on-behalf-of calls will fail until configured"
            );
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(EXCHANGE_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "gatehouse.services.delegation", error = %e, "Failed to build HTTP client with custom config, using defaults");
                Client::new()
            });

        Self {
            client,
            token_url: format!("{}/oauth2/v2.0/token", authority.trim_end_matches('/')),
            credentials,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    /// Exchange `assertion` for a token carrying `scopes`.
    ///
    /// # Errors
    ///
    /// - `MissingAssertion` if `assertion` is empty
    /// - `NotConfigured` if client credentials are absent
    /// - `Failed` if the identity provider rejects the exchange or is unreachable
    #[instrument(skip_all, fields(scopes = ?scopes))]
    pub async fn exchange(
        &self,
        assertion: &str,
        scopes: &[String],
    ) -> Result<DelegatedToken, ExchangeError> {
        if assertion.is_empty() {
            return Err(ExchangeError::MissingAssertion);
        }
        let credentials = self.credentials.as_ref().ok_or(ExchangeError::NotConfigured)?;

        let result = self.request_token(credentials, assertion, scopes).await;
        metrics::record_token_exchange(if result.is_ok() { "success" } else { "error" });
        result
    }

    async fn request_token(
        &self,
        credentials: &ClientCredentials,
        assertion: &str,
        scopes: &[String],
    ) -> Result<DelegatedToken, ExchangeError> {
        let scope = scopes.join(" ");
        let form = [
            ("grant_type", JWT_BEARER_GRANT),
            ("requested_token_use", "on_behalf_of"),
            ("assertion", assertion),
            ("scope", scope.as_str()),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.expose_secret()),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(target: "gatehouse.services.delegation", error = %e, "Token endpoint request failed");
                ExchangeError::Failed(format!("request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => {
                    tracing::warn!(
                        target: "gatehouse.services.delegation",
                        status = %status,
                        error = %err.error,
                        description = err.error_description.as_deref().unwrap_or(""),
                        "On-behalf-of exchange rejected"
                    );
                    err.error
                }
                Err(_) => {
                    tracing::warn!(target: "gatehouse.services.delegation", status = %status, "On-behalf-of exchange failed");
                    format!("status {status}")
                }
            };
            return Err(ExchangeError::Failed(reason));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            tracing::error!(target: "gatehouse.services.delegation", error = %e, "Invalid token endpoint response");
            ExchangeError::Failed("obo_acquire_failed".to_string())
        })?;

        if token.access_token.is_empty() {
            return Err(ExchangeError::Failed("obo_acquire_failed".to_string()));
        }

        let granted = token
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| scopes.to_vec());

        tracing::debug!(target: "gatehouse.services.delegation", "On-behalf-of token acquired");

        Ok(DelegatedToken {
            value: SecretString::from(token.access_token),
            scopes: granted,
            expires_in: token.expires_in,
        })
    }
}

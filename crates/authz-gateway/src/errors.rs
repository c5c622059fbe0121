//! Gateway error types.
//!
//! Every error maps to an HTTP status and a stable machine-readable code via
//! the `IntoResponse` impl. Dependency failures are logged here, server-side;
//! clients only see the code and a generic message.

use crate::auth::pipeline::AuthorizeError;
use crate::services::delegation::ExchangeError;
use crate::services::downstream::DownstreamError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Message returned for every token rejection, whatever the cause.
pub const INVALID_TOKEN_MESSAGE: &str = "The access token is invalid or expired";

/// Gateway error type.
///
/// Maps to HTTP status codes:
/// - InvalidToken: 401 Unauthorized (with `WWW-Authenticate`)
/// - Forbidden: 403 Forbidden
/// - MissingBearerToken: 400 Bad Request
/// - DecisionService, KeyService, CredentialsNotConfigured, ProfileLoad:
///   500 Internal Server Error
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Forbidden by policy")]
    Forbidden,

    #[error("Decision service error: {0}")]
    DecisionService(String),

    #[error("Key service error: {0}")]
    KeyService(String),

    #[error("Missing bearer token")]
    MissingBearerToken,

    #[error("Client credentials not configured")]
    CredentialsNotConfigured,

    #[error("Failed to load profile: {0}")]
    ProfileLoad(String),
}

impl GatewayError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::InvalidToken(_) => 401,
            GatewayError::Forbidden => 403,
            GatewayError::MissingBearerToken => 400,
            GatewayError::DecisionService(_)
            | GatewayError::KeyService(_)
            | GatewayError::CredentialsNotConfigured
            | GatewayError::ProfileLoad(_) => 500,
        }
    }

    /// Stable error code returned in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidToken(_) => "invalid_token",
            GatewayError::Forbidden => "forbidden",
            GatewayError::DecisionService(_) => "decision-service-error",
            GatewayError::KeyService(_) => "key-service-error",
            GatewayError::MissingBearerToken => "missing_bearer_token",
            GatewayError::CredentialsNotConfigured => "client_credentials_not_configured",
            GatewayError::ProfileLoad(_) => "failed_to_load_profile",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let message = match &self {
            GatewayError::InvalidToken(reason) => reason.clone(),
            GatewayError::Forbidden => "Access denied by policy".to_string(),
            GatewayError::MissingBearerToken => {
                "A bearer token is required for this endpoint".to_string()
            }
            GatewayError::DecisionService(reason) => {
                tracing::error!(target: "gatehouse.errors", reason = %reason, "Decision service failure");
                "Authorization decision unavailable".to_string()
            }
            GatewayError::KeyService(reason) => {
                tracing::error!(target: "gatehouse.errors", reason = %reason, "Key service failure");
                "Token verification keys unavailable".to_string()
            }
            GatewayError::CredentialsNotConfigured => {
                tracing::error!(
                    target: "gatehouse.errors",
                    "Delegated call attempted without client credentials configured"
                );
                "Delegated access is not configured".to_string()
            }
            GatewayError::ProfileLoad(reason) => {
                tracing::error!(target: "gatehouse.errors", reason = %reason, "Profile load failed");
                "Failed to load profile".to_string()
            }
        };

        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message,
            },
        };

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            if let Ok(header_value) = "Bearer realm=\"gatehouse\", error=\"invalid_token\"".parse() {
                response
                    .headers_mut()
                    .insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}

impl From<AuthorizeError> for GatewayError {
    fn from(err: AuthorizeError) -> Self {
        match err {
            AuthorizeError::InvalidToken(reason) => {
                tracing::debug!(target: "gatehouse.auth", reason = %reason, "Token rejected");
                GatewayError::InvalidToken(INVALID_TOKEN_MESSAGE.to_string())
            }
            AuthorizeError::KeyService(reason) => GatewayError::KeyService(reason),
            AuthorizeError::Denied => GatewayError::Forbidden,
            AuthorizeError::DecisionFailed(e) => GatewayError::DecisionService(e.to_string()),
        }
    }
}

impl From<ExchangeError> for GatewayError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::MissingAssertion => GatewayError::MissingBearerToken,
            ExchangeError::NotConfigured => GatewayError::CredentialsNotConfigured,
            ExchangeError::Failed(reason) => GatewayError::ProfileLoad(reason),
        }
    }
}

impl From<DownstreamError> for GatewayError {
    fn from(err: DownstreamError) -> Self {
        GatewayError::ProfileLoad(err.to_string())
    }
}

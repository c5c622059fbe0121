//! Demonstration API endpoints.
//!
//! `/api/public` is served without the authorization gate. `/api/protected`
//! sits behind it and echoes whatever claims the gate attached.

use crate::auth::claims::{Authorization, VerifiedClaims};
use axum::{Extension, Json};
use serde::Serialize;
use tracing::instrument;

#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

/// Response for `/api/protected`.
#[derive(Debug, Clone, Serialize)]
pub struct ProtectedResponse {
    pub message: &'static str,

    /// Caller's claims; null for anonymous callers the policy allowed.
    pub user: Option<VerifiedClaims>,
}

/// Handler for GET /api/public
pub async fn public() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "This is a public endpoint",
    })
}

/// Handler for GET /api/protected
///
/// ```json
/// {
///   "message": "This is a protected endpoint",
///   "user": { "sub": "...", "iss": "...", "aud": "..." }
/// }
/// ```
#[instrument(skip_all, name = "gatehouse.handlers.protected")]
pub async fn protected(Extension(auth): Extension<Authorization>) -> Json<ProtectedResponse> {
    tracing::debug!(
        target: "gatehouse.handlers",
        anonymous = auth.claims.is_none(),
        "Serving protected resource"
    );

    Json(ProtectedResponse {
        message: "This is a protected endpoint",
        user: auth.claims,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_public_message() {
        let Json(body) = public().await;
        assert_eq!(
            serde_json::to_value(body).unwrap(),
            json!({"message": "This is a public endpoint"})
        );
    }

    #[tokio::test]
    async fn test_protected_anonymous_user_is_null() {
        let Json(body) = protected(Extension(Authorization::default())).await;
        assert_eq!(
            serde_json::to_value(body).unwrap(),
            json!({"message": "This is a protected endpoint", "user": null})
        );
    }
}

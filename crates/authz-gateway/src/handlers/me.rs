//! Current user profile handler.
//!
//! Exchanges the caller's bearer token on-behalf-of the caller and reads
//! the profile from the downstream directory API.

use crate::auth::pipeline::bearer_token;
use crate::errors::GatewayError;
use crate::routes::AppState;
use crate::services::downstream::Profile;
use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

/// Response for `/api/me`.
#[derive(Debug, Clone, Serialize)]
pub struct MeResponse {
    pub profile: Profile,
}

/// Handler for GET /api/me
///
/// ## Errors
///
/// - 400 `missing_bearer_token` if the request carries no bearer token
/// - 500 `client_credentials_not_configured` without client credentials
/// - 500 `failed_to_load_profile` if the exchange or a required read fails
#[instrument(skip_all, name = "gatehouse.handlers.me")]
pub async fn get_me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, GatewayError> {
    let assertion = bearer_token(headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()))
        .ok_or(GatewayError::MissingBearerToken)?;

    let delegated = state
        .exchanger
        .exchange(assertion, &state.config.downstream_scopes)
        .await?;

    let profile = state.downstream.load_profile(&delegated.value).await?;

    tracing::debug!(target: "gatehouse.handlers", groups = profile.groups.len(), "Profile loaded");

    Ok(Json(MeResponse { profile }))
}

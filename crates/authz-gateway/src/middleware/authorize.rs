//! Authorization gate for protected routes.
//!
//! Builds a `RequestContext` from the inbound request, runs the
//! `Authorizer`, and on allow stores the resulting `Authorization` in
//! request extensions for handlers.

use crate::auth::pipeline::{Authorizer, RequestContext};
use crate::errors::{GatewayError, INVALID_TOKEN_MESSAGE};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::instrument;

/// Peer address used when the server was not started with connect info.
const UNKNOWN_PEER: &str = "unknown";

/// Flatten headers into a name -> value map. Repeated headers are joined
/// with ", "; values that are not visible ASCII are dropped.
fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .keys()
        .filter_map(|name| {
            let values: Vec<&str> = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            if values.is_empty() {
                None
            } else {
                Some((name.as_str().to_string(), values.join(", ")))
            }
        })
        .collect()
}

fn request_context(req: &Request) -> RequestContext {
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_PEER.to_string());

    RequestContext {
        method: req.method().to_string(),
        path: req.uri().path().to_string(),
        ip,
        headers: flatten_headers(req.headers()),
    }
}

/// Authorization middleware.
///
/// # Response
///
/// - 401 if a presented bearer token fails verification, or the
///   `Authorization` header is not visible ASCII
/// - 403 if the policy denies
/// - 500 if the key set or the decision service is unavailable
/// - Otherwise continues with `Authorization` in extensions
#[instrument(skip_all, name = "gatehouse.middleware.authorize")]
pub async fn require_authorization(
    State(authorizer): State<Arc<Authorizer>>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let ctx = request_context(&req);
    let header = match req.headers().get(AUTHORIZATION).map(|h| h.to_str()) {
        None => None,
        Some(Ok(value)) => Some(value.to_string()),
        Some(Err(_)) if authorizer.allows_all() => None,
        Some(Err(_)) => {
            tracing::debug!(
                target: "gatehouse.middleware",
                "Authorization header is not visible ASCII"
            );
            return Err(GatewayError::InvalidToken(INVALID_TOKEN_MESSAGE.to_string()));
        }
    };

    let authorization = authorizer.authorize(header.as_deref(), ctx).await?;

    req.extensions_mut().insert(authorization);

    Ok(next.run(req).await)
}

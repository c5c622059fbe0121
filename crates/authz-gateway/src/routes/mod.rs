//! HTTP routes for the authorization gateway.
//!
//! Defines the Axum router and application state.

use crate::auth::pipeline::Authorizer;
use crate::config::Config;
use crate::handlers;
use crate::middleware::{http_metrics_middleware, require_authorization};
use crate::services::delegation::{ClientCredentials, DelegationExchanger};
use crate::services::downstream::DownstreamClient;
use axum::{middleware, routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,

    /// On-behalf-of exchanger for delegated downstream calls.
    pub exchanger: DelegationExchanger,

    /// Downstream directory API client.
    pub downstream: DownstreamClient,
}

impl AppState {
    /// Build state from configuration.
    ///
    /// Delegation is configured only when both `CLIENT_ID` and
    /// `CLIENT_SECRET` are present.
    pub fn new(config: Config) -> Self {
        let credentials = match (&config.client_id, &config.client_secret) {
            (Some(client_id), Some(client_secret)) => Some(ClientCredentials {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            }),
            _ => None,
        };

        let exchanger = DelegationExchanger::new(&config.token_authority, credentials);
        let downstream = DownstreamClient::new(config.downstream_api_url.clone());

        Self {
            config,
            exchanger,
            downstream,
        }
    }
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/health` - Liveness probe - public
/// - `/metrics` - Prometheus metrics endpoint - public
/// - `/api/public` - Anonymous endpoint - public
/// - `/api/protected` - Echoes the caller's claims - behind the authorization gate
/// - `/api/me` - Delegated profile lookup - behind the authorization gate
/// - TraceLayer for request logging
/// - HTTP metrics middleware
/// - 30 second request timeout
pub fn build_routes(
    state: Arc<AppState>,
    authorizer: Arc<Authorizer>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let public_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/public", get(handlers::public))
        .with_state(state.clone());

    // Metrics route with its own state
    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    let protected_routes = Router::new()
        .route("/api/protected", get(handlers::protected))
        .route("/api/me", get(handlers::get_me))
        .route_layer(middleware::from_fn_with_state(
            authorizer,
            require_authorization,
        ))
        .with_state(state);

    with_global_layers(
        public_routes
            .merge(metrics_routes)
            .merge(protected_routes),
    )
}

/// Request timeout applied to every route.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn with_global_layers(router: Router) -> Router {
    // Each .layer() wraps the ones above it. Request order:
    // 1. http_metrics_middleware (outermost, sees every response incl. timeouts)
    // 2. TimeoutLayer
    // 3. TraceLayer (innermost, spans the routed handler only)
    router
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(middleware::from_fn(http_metrics_middleware))
}

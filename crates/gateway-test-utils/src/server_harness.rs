//! Test server harness for E2E testing
//!
//! Provides `TestGatewayServer` for spawning real gateway instances in tests.

use authz_gateway::auth::pipeline::Authorizer;
use authz_gateway::config::Config;
use authz_gateway::observability::metrics::init_metrics_recorder;
use authz_gateway::routes::{self, AppState};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;

use crate::fixtures::{TEST_AUDIENCE, TEST_ISSUER};

/// Global metrics handle for test servers.
static TEST_METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics handle shared by every test server in the process.
///
/// Only one global recorder can be installed; later callers reuse it, and
/// if another test already installed one we fall back to a detached handle.
pub fn test_metrics_handle() -> PrometheusHandle {
    TEST_METRICS_HANDLE
        .get_or_init(|| {
            init_metrics_recorder()
                .unwrap_or_else(|_| PrometheusBuilder::new().build_recorder().handle())
        })
        .clone()
}

/// Environment for a gateway that trusts the test issuer and keys.
pub fn gateway_vars(jwks_url: &str, decision_url: &str) -> HashMap<String, String> {
    HashMap::from([
        ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
        ("JWKS_URL".to_string(), jwks_url.to_string()),
        ("DECISION_URL".to_string(), decision_url.to_string()),
        ("TOKEN_ISSUER".to_string(), TEST_ISSUER.to_string()),
        ("TOKEN_AUDIENCE".to_string(), TEST_AUDIENCE.to_string()),
        ("JWT_ALLOWED_ALGORITHMS".to_string(), "EdDSA".to_string()),
    ])
}

/// Test harness for spawning the gateway in E2E tests.
///
/// # Example
/// ```rust,ignore
/// let server = TestGatewayServer::spawn(gateway_vars(&jwks_url, &decision_url)).await?;
/// let response = reqwest::get(format!("{}/health", server.url())).await?;
/// assert_eq!(response.status(), 200);
/// ```
pub struct TestGatewayServer {
    addr: SocketAddr,
    config: Config,
    _handle: JoinHandle<()>,
}

impl TestGatewayServer {
    /// Spawn a gateway configured from `vars`.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the HTTP server in the background
    pub async fn spawn(vars: HashMap<String, String>) -> Result<Self, anyhow::Error> {
        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let authorizer = Authorizer::from_config(&config)
            .map_err(|e| anyhow::anyhow!("Failed to build authorizer: {}", e))?;
        let state = Arc::new(AppState::new(config.clone()));

        // Build routes using the gateway's real route builder
        let app = routes::build_routes(state, Arc::new(authorizer), test_metrics_handle());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            // ConnectInfo feeds the client IP into policy queries
            let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, make_service).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            config,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get reference to the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for TestGatewayServer {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

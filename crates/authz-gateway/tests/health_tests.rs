//! Operational endpoint integration tests.
//!
//! `/health`, `/metrics` and unknown routes, using the `TestGatewayServer`
//! harness.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use gateway_test_utils::{
    gateway_vars, mount_jwks, mount_policy, TestGatewayServer, TestKeypair,
};
use serde_json::json;
use wiremock::MockServer;

async fn spawn() -> Result<(MockServer, TestGatewayServer), anyhow::Error> {
    let upstream = MockServer::start().await;
    let keypair = TestKeypair::new(1, "health-key");
    let jwks_url = mount_jwks(&upstream, &[&keypair]).await;
    let decision_url = mount_policy(&upstream, json!(false)).await;
    let server = TestGatewayServer::spawn(gateway_vars(&jwks_url, &decision_url)).await?;
    Ok((upstream, server))
}

#[tokio::test]
async fn test_health_endpoint_returns_json() -> Result<(), anyhow::Error> {
    let (_upstream, server) = spawn().await?;

    let response = reqwest::get(format!("{}/health", server.url())).await?;

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body, json!({"status": "healthy"}));

    Ok(())
}

#[tokio::test]
async fn test_unknown_route_returns_404() -> Result<(), anyhow::Error> {
    let (_upstream, server) = spawn().await?;

    let response = reqwest::get(format!("{}/api/nonexistent", server.url())).await?;

    assert_eq!(response.status(), 404);

    Ok(())
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_gateway_metrics() -> Result<(), anyhow::Error> {
    let (_upstream, server) = spawn().await?;
    let client = reqwest::Client::new();

    // Policy denies everything: produces a 403 through the gate
    let denied = client
        .get(format!("{}/api/protected", server.url()))
        .send()
        .await?;
    assert_eq!(denied.status(), 403);

    let response = client.get(format!("{}/metrics", server.url())).send().await?;
    assert_eq!(response.status(), 200);

    let body = response.text().await?;
    assert!(body.contains("gatehouse_http_requests_total"));
    assert!(body.contains("gatehouse_decisions_total"));

    Ok(())
}

//! # Gateway Test Utilities
//!
//! Shared test utilities for the authorization gateway.
//!
//! This crate provides:
//! - Deterministic Ed25519 signing keys and a JWT builder (`TestKeypair`, `TokenBuilder`)
//! - wiremock mounts for the key set, policy and token endpoints
//! - Server test harness (`TestGatewayServer` for E2E tests)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gateway_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<()> {
//!     let idp = MockServer::start().await;
//!     let keypair = TestKeypair::new(1, "test-key-01");
//!     let jwks_url = mount_jwks(&idp, &[&keypair]).await;
//!     let decision_url = mount_policy(&idp, json!(true)).await;
//!
//!     let server = TestGatewayServer::spawn(gateway_vars(&jwks_url, &decision_url)).await?;
//!     let token = TokenBuilder::new(TEST_ISSUER).audience(TEST_AUDIENCE).sign(&keypair);
//!
//!     let response = reqwest::Client::new()
//!         .get(format!("{}/api/protected", server.url()))
//!         .bearer_auth(token)
//!         .send()
//!         .await?;
//!
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod mock_endpoints;
pub mod server_harness;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_endpoints::*;
pub use server_harness::*;

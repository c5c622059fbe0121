//! wiremock mounts for the gateway's upstream dependencies.
//!
//! Each helper mounts a responder on a shared `MockServer` and returns the
//! URL the gateway should be configured with.

use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::fixtures::TestKeypair;

pub const JWKS_PATH: &str = "/test-tenant/discovery/v2.0/keys";
pub const POLICY_PATH: &str = "/v1/data/authz/allow";
pub const TOKEN_PATH: &str = "/test-tenant/oauth2/v2.0/token";

/// Serve a key set holding the given keys. Returns the JWKS URL.
pub async fn mount_jwks(server: &MockServer, keys: &[&TestKeypair]) -> String {
    let jwks = json!({
        "keys": keys.iter().map(|k| k.jwk_json()).collect::<Vec<_>>()
    });

    Mock::given(method("GET"))
        .and(path(JWKS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks))
        .mount(server)
        .await;

    format!("{}{}", server.uri(), JWKS_PATH)
}

/// Answer every policy query with `{"result": result}`. Returns the decision URL.
pub async fn mount_policy(server: &MockServer, result: Value) -> String {
    Mock::given(method("POST"))
        .and(path(POLICY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "result": result })))
        .mount(server)
        .await;

    format!("{}{}", server.uri(), POLICY_PATH)
}

/// Answer every policy query with a bare status code. Returns the decision URL.
pub async fn mount_policy_status(server: &MockServer, status: u16) -> String {
    Mock::given(method("POST"))
        .and(path(POLICY_PATH))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;

    format!("{}{}", server.uri(), POLICY_PATH)
}

/// Issue `access_token` for on-behalf-of exchanges. Returns the authority URL.
pub async fn mount_obo_token_endpoint(server: &MockServer, access_token: &str) -> String {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("requested_token_use=on_behalf_of"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token_type": "Bearer",
            "access_token": access_token,
            "expires_in": 3599,
            "scope": "https://graph.microsoft.com/User.Read"
        })))
        .mount(server)
        .await;

    format!("{}/test-tenant", server.uri())
}

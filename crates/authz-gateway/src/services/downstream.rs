//! Downstream directory API client (Microsoft Graph compatible).
//!
//! Called with a delegated token. Profile pieces are independent reads and
//! are fetched concurrently.

use crate::observability::metrics;
use common::secret::{ExposeSecret, SecretString};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::instrument;

/// Default downstream API base URL.
pub const DEFAULT_DOWNSTREAM_API_URL: &str = "https://graph.microsoft.com/v1.0";

const DOWNSTREAM_TIMEOUT_SECS: u64 = 10;

const USER_SELECT: &str =
    "id,givenName,surname,displayName,mail,userPrincipalName,employeeId,jobTitle,department";
const MANAGER_SELECT: &str = "displayName,id,mail";

/// Downstream call failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownstreamError {
    /// Non-2xx response other than an expected 404.
    #[error("downstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("downstream request failed: {0}")]
    Transport(String),
}

/// Group membership entry.
///
/// `display_name` falls back to `true` for an unnamed security group, then
/// to the group's mail address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub id: Option<String>,
    #[serde(rename = "displayName")]
    pub display_name: Option<Value>,
}

impl Group {
    fn from_directory_object(object: &Value) -> Self {
        let text = |name: &str| {
            object
                .get(name)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            id: text("id"),
            display_name: text("displayName")
                .map(Value::String)
                .or_else(|| {
                    object
                        .get("securityEnabled")
                        .filter(|v| v.as_bool() == Some(true))
                        .cloned()
                })
                .or_else(|| text("mail").map(Value::String)),
        }
    }
}

/// Aggregated profile of the calling user.
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub user: Value,
    pub manager: Option<Value>,
    pub groups: Vec<Group>,
    pub organization: Option<Value>,
}

/// Client for the downstream API.
#[derive(Clone)]
pub struct DownstreamClient {
    client: Client,
    base_url: String,
}

impl DownstreamClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(DOWNSTREAM_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(target: "gatehouse.services.downstream", error = %e, "Failed to build HTTP client with custom config, using defaults");
                Client::new()
            });

        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// GET `path` and parse the JSON body.
    ///
    /// # Errors
    ///
    /// `Status` for any non-2xx response, `Transport` for network and body errors.
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
        token: &SecretString,
    ) -> Result<Value, DownstreamError> {
        self.get_optional_json(path, query, token)
            .await?
            .ok_or_else(|| DownstreamError::Status {
                status: StatusCode::NOT_FOUND.as_u16(),
                body: String::new(),
            })
    }

    /// GET `path`, treating 404 as an empty result.
    pub async fn get_optional_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
        token: &SecretString,
    ) -> Result<Option<Value>, DownstreamError> {
        let url = format!("{}{}", self.base_url, path);
        let start = Instant::now();

        let response = self
            .client
            .get(&url)
            .query(query)
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(target: "gatehouse.services.downstream", path = %path, error = %e, "Downstream request failed");
                DownstreamError::Transport(e.to_string())
            })?;

        let status = response.status();
        metrics::record_downstream_request(path, status.as_u16(), start.elapsed());

        if status == StatusCode::NOT_FOUND {
            tracing::debug!(target: "gatehouse.services.downstream", path = %path, "Downstream resource not found");
            return Ok(None);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(target: "gatehouse.services.downstream", path = %path, status = %status, "Downstream returned error status");
            return Err(DownstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Value>()
            .await
            .map(Some)
            .map_err(|e| DownstreamError::Transport(format!("invalid JSON from {path}: {e}")))
    }

    async fn user(&self, token: &SecretString) -> Result<Value, DownstreamError> {
        self.get_json("/me", &[("$select", USER_SELECT)], token).await
    }

    /// The user's manager; `None` when the user has none (404).
    async fn manager(&self, token: &SecretString) -> Result<Option<Value>, DownstreamError> {
        self.get_optional_json("/me/manager", &[("$select", MANAGER_SELECT)], token)
            .await
    }

    async fn groups(&self, token: &SecretString) -> Result<Vec<Group>, DownstreamError> {
        let body = self.get_json("/me/memberOf", &[], token).await?;
        Ok(body
            .get("value")
            .and_then(Value::as_array)
            .map(|objects| objects.iter().map(Group::from_directory_object).collect())
            .unwrap_or_default())
    }

    /// First organization entry; any failure yields `None`.
    async fn organization(&self, token: &SecretString) -> Option<Value> {
        match self.get_json("/organization", &[], token).await {
            Ok(body) => body
                .get("value")
                .and_then(Value::as_array)
                .and_then(|orgs| orgs.first())
                .cloned(),
            Err(e) => {
                tracing::debug!(target: "gatehouse.services.downstream", error = %e, "Organization lookup failed, omitting");
                None
            }
        }
    }

    /// Load the caller's profile.
    ///
    /// User, manager, groups and organization are fetched concurrently.
    ///
    /// # Errors
    ///
    /// Fails if the user, manager (other than 404) or groups call fails.
    #[instrument(skip_all)]
    pub async fn load_profile(&self, token: &SecretString) -> Result<Profile, DownstreamError> {
        let (user, manager, groups, organization) = tokio::try_join!(
            self.user(token),
            self.manager(token),
            self.groups(token),
            async { Ok::<_, DownstreamError>(self.organization(token).await) },
        )?;

        Ok(Profile {
            user,
            manager,
            groups,
            organization,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token() -> SecretString {
        SecretString::from("delegated")
    }

    async fn mount(server: &MockServer, route: &str, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(route))
            .and(header("authorization", "Bearer delegated"))
            .respond_with(response)
            .mount(server)
            .await;
    }

    async fn mount_happy_profile(server: &MockServer) {
        mount(
            server,
            "/me",
            ResponseTemplate::new(200).set_body_json(json!({"id": "u1", "displayName": "Ada"})),
        )
        .await;
        mount(
            server,
            "/me/manager",
            ResponseTemplate::new(200).set_body_json(json!({"id": "m1", "displayName": "Grace"})),
        )
        .await;
        mount(
            server,
            "/me/memberOf",
            ResponseTemplate::new(200).set_body_json(json!({"value": [
                {"id": "g1", "displayName": "Engineering"},
                {"id": "g2", "mail": "ops@example.com"},
                {"id": "g3", "securityEnabled": true}
            ]})),
        )
        .await;
        mount(
            server,
            "/organization",
            ResponseTemplate::new(200).set_body_json(json!({"value": [{"id": "o1"}, {"id": "o2"}]})),
        )
        .await;
    }

    #[tokio::test]
    async fn test_get_json_sends_select_and_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .and(query_param("$select", USER_SELECT))
            .and(header("authorization", "Bearer delegated"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "u1"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = DownstreamClient::new(server.uri());
        let user = client.user(&token()).await.unwrap();
        assert_eq!(user["id"], "u1");
    }

    #[tokio::test]
    async fn test_get_optional_json_404_is_none() {
        let server = MockServer::start().await;
        mount(&server, "/me/manager", ResponseTemplate::new(404)).await;

        let client = DownstreamClient::new(server.uri());
        assert_eq!(client.manager(&token()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_non_2xx_carries_status_and_body() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/me",
            ResponseTemplate::new(403).set_body_string("Authorization_RequestDenied"),
        )
        .await;

        let client = DownstreamClient::new(server.uri());
        assert_eq!(
            client.user(&token()).await.unwrap_err(),
            DownstreamError::Status {
                status: 403,
                body: "Authorization_RequestDenied".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_required_resource_404_is_error() {
        let server = MockServer::start().await;
        mount(&server, "/me", ResponseTemplate::new(404)).await;

        let client = DownstreamClient::new(server.uri());
        assert!(matches!(
            client.user(&token()).await,
            Err(DownstreamError::Status { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_load_profile_aggregates() {
        let server = MockServer::start().await;
        mount_happy_profile(&server).await;

        let client = DownstreamClient::new(format!("{}/", server.uri()));
        let profile = client.load_profile(&token()).await.unwrap();

        assert_eq!(profile.user["displayName"], "Ada");
        assert_eq!(profile.manager.unwrap()["displayName"], "Grace");
        assert_eq!(
            profile.groups,
            vec![
                Group {
                    id: Some("g1".to_string()),
                    display_name: Some(json!("Engineering"))
                },
                Group {
                    id: Some("g2".to_string()),
                    display_name: Some(json!("ops@example.com"))
                },
                Group {
                    id: Some("g3".to_string()),
                    display_name: Some(json!(true))
                },
            ]
        );
        assert_eq!(profile.organization, Some(json!({"id": "o1"})));
    }

    #[test]
    fn test_group_display_name_fallback_order() {
        let cases = [
            (
                json!({"id": "a", "displayName": "Admins", "securityEnabled": true, "mail": "a@x"}),
                Some(json!("Admins")),
            ),
            (
                json!({"id": "b", "securityEnabled": true, "mail": "b@x"}),
                Some(json!(true)),
            ),
            (
                json!({"id": "c", "securityEnabled": false, "mail": "c@x"}),
                Some(json!("c@x")),
            ),
            (json!({"id": "d", "displayName": ""}), None),
        ];

        for (object, expected) in cases {
            assert_eq!(Group::from_directory_object(&object).display_name, expected, "{object}");
        }
    }

    #[tokio::test]
    async fn test_load_profile_tolerates_missing_manager_and_org() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/me",
            ResponseTemplate::new(200).set_body_json(json!({"id": "u1"})),
        )
        .await;
        mount(&server, "/me/manager", ResponseTemplate::new(404)).await;
        mount(
            &server,
            "/me/memberOf",
            ResponseTemplate::new(200).set_body_json(json!({"value": []})),
        )
        .await;
        mount(&server, "/organization", ResponseTemplate::new(500)).await;

        let client = DownstreamClient::new(server.uri());
        let profile = client.load_profile(&token()).await.unwrap();

        assert!(profile.manager.is_none());
        assert!(profile.groups.is_empty());
        assert!(profile.organization.is_none());
    }

    #[tokio::test]
    async fn test_load_profile_fails_when_groups_fail() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/me",
            ResponseTemplate::new(200).set_body_json(json!({"id": "u1"})),
        )
        .await;
        mount(&server, "/me/manager", ResponseTemplate::new(404)).await;
        mount(&server, "/me/memberOf", ResponseTemplate::new(401)).await;
        mount(
            &server,
            "/organization",
            ResponseTemplate::new(200).set_body_json(json!({"value": []})),
        )
        .await;

        let client = DownstreamClient::new(server.uri());
        assert!(matches!(
            client.load_profile(&token()).await,
            Err(DownstreamError::Status { status: 401, .. })
        ));
    }
}

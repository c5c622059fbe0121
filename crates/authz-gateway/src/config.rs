//! Gateway configuration.
//!
//! Configuration is loaded from environment variables. The client secret is
//! held as a `SecretString` and redacted in Debug output.

use crate::auth::jwks::{DEFAULT_CACHE_TTL, DEFAULT_FETCHES_PER_MINUTE, DEFAULT_MAX_ENTRIES};
use crate::services::decision_client::DEFAULT_DECISION_TIMEOUT_SECS;
use crate::services::downstream::DEFAULT_DOWNSTREAM_API_URL;
use common::jwt::{DEFAULT_CLOCK_SKEW, MAX_CLOCK_SKEW};
use common::secret::SecretString;
use jsonwebtoken::Algorithm;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default policy decision endpoint.
pub const DEFAULT_DECISION_URL: &str = "http://opa:8181/v1/data/authz/allow";

/// Tenant used when `IDP_TENANT_ID` is unset.
pub const DEFAULT_TENANT_ID: &str = "common";

/// Identity provider login host.
pub const IDP_LOGIN_BASE: &str = "https://login.microsoftonline.com";

/// Scope requested for downstream calls when `DOWNSTREAM_SCOPES` is unset.
pub const DEFAULT_DOWNSTREAM_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Upper bound for the decision timeout.
pub const MAX_DECISION_TIMEOUT_SECS: u64 = 60;

/// Gateway configuration.
#[derive(Clone)]
pub struct Config {
    /// HTTP bind address (default: "0.0.0.0:3000").
    pub bind_address: String,

    /// Policy decision endpoint.
    pub decision_url: String,

    pub decision_timeout: Duration,

    /// Development flag: skip verification and policy entirely.
    pub allow_all: bool,

    /// Development flag: decode tokens without verifying them.
    pub disable_jwt_validation: bool,

    pub tenant_id: String,

    /// Expected `iss` claim.
    pub token_issuer: String,

    /// Expected `aud` claim; unchecked when `None`.
    pub token_audience: Option<String>,

    /// Key-set (JWKS) endpoint.
    pub jwks_url: String,

    pub jwks_cache_max_entries: u64,

    pub jwks_cache_ttl: Duration,

    /// Key-set fetches allowed per rolling minute.
    pub jwks_requests_per_minute: u32,

    /// Leeway on `exp` and `nbf`; zero unless configured.
    pub jwt_clock_skew: Duration,

    /// Algorithms accepted for token signatures (asymmetric only).
    pub allowed_algorithms: Vec<Algorithm>,

    /// Confidential client id for on-behalf-of exchange.
    pub client_id: Option<String>,

    pub client_secret: Option<SecretString>,

    /// Authority hosting the token endpoint.
    pub token_authority: String,

    /// Downstream API base URL.
    pub downstream_api_url: String,

    /// Scopes requested for delegated tokens.
    pub downstream_scopes: Vec<String>,
}

/// Custom Debug implementation that redacts the client secret.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("decision_url", &self.decision_url)
            .field("decision_timeout", &self.decision_timeout)
            .field("allow_all", &self.allow_all)
            .field("disable_jwt_validation", &self.disable_jwt_validation)
            .field("tenant_id", &self.tenant_id)
            .field("token_issuer", &self.token_issuer)
            .field("token_audience", &self.token_audience)
            .field("jwks_url", &self.jwks_url)
            .field("jwks_cache_max_entries", &self.jwks_cache_max_entries)
            .field("jwks_cache_ttl", &self.jwks_cache_ttl)
            .field("jwks_requests_per_minute", &self.jwks_requests_per_minute)
            .field("jwt_clock_skew", &self.jwt_clock_skew)
            .field("allowed_algorithms", &self.allowed_algorithms)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_authority", &self.token_authority)
            .field("downstream_api_url", &self.downstream_api_url)
            .field("downstream_scopes", &self.downstream_scopes)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid decision timeout configuration: {0}")]
    InvalidDecisionTimeout(String),

    #[error("Invalid JWKS cache configuration: {0}")]
    InvalidJwksCache(String),

    #[error("Invalid JWKS rate limit configuration: {0}")]
    InvalidJwksRateLimit(String),

    #[error("Invalid JWT clock skew configuration: {0}")]
    InvalidJwtClockSkew(String),

    #[error("Invalid JWT algorithm configuration: {0}")]
    InvalidAlgorithms(String),

    #[error("Invalid downstream scope configuration: {0}")]
    InvalidScopes(String),
}

/// Read an optional variable, treating empty values as unset.
fn non_empty(vars: &HashMap<String, String>, name: &str) -> Option<String> {
    vars.get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Development flags are enabled only by the literal `true`.
fn flag(vars: &HashMap<String, String>, name: &str) -> bool {
    vars.get(name).is_some_and(|v| v == "true")
}

/// Parse a positive integer variable, falling back to `default` when unset.
fn positive_u64(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, String> {
    let Some(value_str) = vars.get(name) else {
        return Ok(default);
    };

    let value: u64 = value_str.parse().map_err(|e| {
        format!(
            "{} must be a valid positive integer, got '{}': {}",
            name, value_str, e
        )
    })?;

    if value == 0 {
        return Err(format!("{} must be greater than 0", name));
    }

    Ok(value)
}

fn parse_algorithms(raw: &str) -> Result<Vec<Algorithm>, ConfigError> {
    let mut algorithms = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let algorithm = Algorithm::from_str(name).map_err(|_| {
            ConfigError::InvalidAlgorithms(format!(
                "JWT_ALLOWED_ALGORITHMS contains unknown algorithm '{}'",
                name
            ))
        })?;

        if matches!(
            algorithm,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(ConfigError::InvalidAlgorithms(format!(
                "JWT_ALLOWED_ALGORITHMS must list asymmetric algorithms only, got '{}'",
                name
            )));
        }

        if !algorithms.contains(&algorithm) {
            algorithms.push(algorithm);
        }
    }

    if algorithms.is_empty() {
        return Err(ConfigError::InvalidAlgorithms(
            "JWT_ALLOWED_ALGORITHMS must name at least one algorithm".to_string(),
        ));
    }

    Ok(algorithms)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address =
            non_empty(vars, "BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let decision_url =
            non_empty(vars, "DECISION_URL").unwrap_or_else(|| DEFAULT_DECISION_URL.to_string());

        let decision_timeout_secs = positive_u64(
            vars,
            "DECISION_TIMEOUT_SECONDS",
            DEFAULT_DECISION_TIMEOUT_SECS,
        )
        .map_err(ConfigError::InvalidDecisionTimeout)?;
        if decision_timeout_secs > MAX_DECISION_TIMEOUT_SECS {
            return Err(ConfigError::InvalidDecisionTimeout(format!(
                "DECISION_TIMEOUT_SECONDS must not exceed {} seconds, got {}",
                MAX_DECISION_TIMEOUT_SECS, decision_timeout_secs
            )));
        }

        let allow_all = flag(vars, "ALLOW_ALL");
        let disable_jwt_validation = flag(vars, "DISABLE_JWT_VALIDATION");

        let tenant_id =
            non_empty(vars, "IDP_TENANT_ID").unwrap_or_else(|| DEFAULT_TENANT_ID.to_string());

        let token_issuer = non_empty(vars, "TOKEN_ISSUER")
            .unwrap_or_else(|| format!("{}/{}/v2.0", IDP_LOGIN_BASE, tenant_id));

        let client_id = non_empty(vars, "CLIENT_ID");
        let client_secret = non_empty(vars, "CLIENT_SECRET").map(SecretString::from);

        // The API's own client id is the audience unless one is given
        let token_audience = non_empty(vars, "TOKEN_AUDIENCE").or_else(|| client_id.clone());

        let jwks_url = non_empty(vars, "JWKS_URL").unwrap_or_else(|| {
            format!("{}/{}/discovery/v2.0/keys", IDP_LOGIN_BASE, tenant_id)
        });

        let jwks_cache_max_entries =
            positive_u64(vars, "JWKS_CACHE_MAX_ENTRIES", DEFAULT_MAX_ENTRIES)
                .map_err(ConfigError::InvalidJwksCache)?;

        let jwks_cache_ttl = Duration::from_secs(
            positive_u64(vars, "JWKS_CACHE_TTL_SECONDS", DEFAULT_CACHE_TTL.as_secs())
                .map_err(ConfigError::InvalidJwksCache)?,
        );

        let jwks_requests_per_minute = positive_u64(
            vars,
            "JWKS_REQUESTS_PER_MINUTE",
            u64::from(DEFAULT_FETCHES_PER_MINUTE),
        )
        .and_then(|v| {
            u32::try_from(v).map_err(|_| {
                format!("JWKS_REQUESTS_PER_MINUTE must fit in 32 bits, got {}", v)
            })
        })
        .map_err(ConfigError::InvalidJwksRateLimit)?;

        // Parse JWT clock skew tolerance with validation
        let jwt_clock_skew = if let Some(value_str) = vars.get("JWT_CLOCK_SKEW_SECONDS") {
            let value: i64 = value_str.parse().map_err(|e| {
                ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must be a valid integer, got '{}': {}",
                    value_str, e
                ))
            })?;

            if value < 0 {
                return Err(ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must not be negative, got {}",
                    value
                )));
            }

            let value = value.unsigned_abs();
            if value > MAX_CLOCK_SKEW.as_secs() {
                return Err(ConfigError::InvalidJwtClockSkew(format!(
                    "JWT_CLOCK_SKEW_SECONDS must not exceed {} seconds, got {}",
                    MAX_CLOCK_SKEW.as_secs(),
                    value
                )));
            }

            Duration::from_secs(value)
        } else {
            DEFAULT_CLOCK_SKEW
        };

        let allowed_algorithms = match vars.get("JWT_ALLOWED_ALGORITHMS") {
            Some(raw) => parse_algorithms(raw)?,
            None => vec![Algorithm::RS256],
        };

        let token_authority = non_empty(vars, "TOKEN_AUTHORITY")
            .unwrap_or_else(|| format!("{}/{}", IDP_LOGIN_BASE, tenant_id));

        let downstream_api_url = non_empty(vars, "DOWNSTREAM_API_URL")
            .unwrap_or_else(|| DEFAULT_DOWNSTREAM_API_URL.to_string());

        let downstream_scopes = match vars.get("DOWNSTREAM_SCOPES") {
            Some(raw) => {
                let scopes: Vec<String> = raw
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if scopes.is_empty() {
                    return Err(ConfigError::InvalidScopes(
                        "DOWNSTREAM_SCOPES must name at least one scope".to_string(),
                    ));
                }
                scopes
            }
            None => vec![DEFAULT_DOWNSTREAM_SCOPE.to_string()],
        };

        Ok(Config {
            bind_address,
            decision_url,
            decision_timeout: Duration::from_secs(decision_timeout_secs),
            allow_all,
            disable_jwt_validation,
            tenant_id,
            token_issuer,
            token_audience,
            jwks_url,
            jwks_cache_max_entries,
            jwks_cache_ttl,
            jwks_requests_per_minute,
            jwt_clock_skew,
            allowed_algorithms,
            client_id,
            client_secret,
            token_authority,
            downstream_api_url,
            downstream_scopes,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "IDP_TENANT_ID".to_string(),
            "contoso-tenant".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.decision_url, "http://opa:8181/v1/data/authz/allow");
        assert_eq!(config.decision_timeout, Duration::from_secs(5));
        assert!(!config.allow_all);
        assert!(!config.disable_jwt_validation);
        assert_eq!(config.tenant_id, "common");
        assert_eq!(
            config.token_issuer,
            "https://login.microsoftonline.com/common/v2.0"
        );
        assert_eq!(
            config.jwks_url,
            "https://login.microsoftonline.com/common/discovery/v2.0/keys"
        );
        assert!(config.token_audience.is_none());
        assert_eq!(config.jwks_cache_max_entries, 5);
        assert_eq!(config.jwks_cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.jwks_requests_per_minute, 10);
        assert_eq!(config.jwt_clock_skew, DEFAULT_CLOCK_SKEW);
        assert_eq!(config.allowed_algorithms, vec![Algorithm::RS256]);
        assert!(config.client_id.is_none());
        assert!(config.client_secret.is_none());
        assert_eq!(
            config.token_authority,
            "https://login.microsoftonline.com/common"
        );
        assert_eq!(config.downstream_api_url, "https://graph.microsoft.com/v1.0");
        assert_eq!(
            config.downstream_scopes,
            vec!["https://graph.microsoft.com/.default"]
        );
    }

    #[test]
    fn test_tenant_derives_idp_urls() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(
            config.token_issuer,
            "https://login.microsoftonline.com/contoso-tenant/v2.0"
        );
        assert_eq!(
            config.jwks_url,
            "https://login.microsoftonline.com/contoso-tenant/discovery/v2.0/keys"
        );
        assert_eq!(
            config.token_authority,
            "https://login.microsoftonline.com/contoso-tenant"
        );
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string());
        vars.insert(
            "DECISION_URL".to_string(),
            "http://policy.local/v1/data/gate".to_string(),
        );
        vars.insert("DECISION_TIMEOUT_SECONDS".to_string(), "2".to_string());
        vars.insert("TOKEN_ISSUER".to_string(), "https://issuer.example".to_string());
        vars.insert("TOKEN_AUDIENCE".to_string(), "api://orders".to_string());
        vars.insert("CLIENT_ID".to_string(), "client-123".to_string());
        vars.insert("JWKS_URL".to_string(), "https://issuer.example/keys".to_string());
        vars.insert("JWKS_CACHE_MAX_ENTRIES".to_string(), "20".to_string());
        vars.insert("JWKS_CACHE_TTL_SECONDS".to_string(), "600".to_string());
        vars.insert("JWKS_REQUESTS_PER_MINUTE".to_string(), "3".to_string());
        vars.insert("JWT_CLOCK_SKEW_SECONDS".to_string(), "120".to_string());
        vars.insert(
            "JWT_ALLOWED_ALGORITHMS".to_string(),
            "RS256, ES256,EdDSA".to_string(),
        );
        vars.insert(
            "DOWNSTREAM_SCOPES".to_string(),
            "User.Read, GroupMember.Read.All".to_string(),
        );

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.decision_url, "http://policy.local/v1/data/gate");
        assert_eq!(config.decision_timeout, Duration::from_secs(2));
        assert_eq!(config.token_issuer, "https://issuer.example");
        assert_eq!(config.token_audience.as_deref(), Some("api://orders"));
        assert_eq!(config.jwks_url, "https://issuer.example/keys");
        assert_eq!(config.jwks_cache_max_entries, 20);
        assert_eq!(config.jwks_cache_ttl, Duration::from_secs(600));
        assert_eq!(config.jwks_requests_per_minute, 3);
        assert_eq!(config.jwt_clock_skew, Duration::from_secs(120));
        assert_eq!(
            config.allowed_algorithms,
            vec![Algorithm::RS256, Algorithm::ES256, Algorithm::EdDSA]
        );
        assert_eq!(
            config.downstream_scopes,
            vec!["User.Read", "GroupMember.Read.All"]
        );
    }

    #[test]
    fn test_audience_falls_back_to_client_id() {
        let mut vars = base_vars();
        vars.insert("CLIENT_ID".to_string(), "client-123".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");
        assert_eq!(config.token_audience.as_deref(), Some("client-123"));
    }

    #[test]
    fn test_dev_flags_require_literal_true() {
        for value in ["1", "yes", "TRUE", "True", " true", ""] {
            let mut vars = base_vars();
            vars.insert("ALLOW_ALL".to_string(), value.to_string());
            vars.insert("DISABLE_JWT_VALIDATION".to_string(), value.to_string());

            let config = Config::from_vars(&vars).unwrap();
            assert!(!config.allow_all, "ALLOW_ALL={value:?} must not enable");
            assert!(!config.disable_jwt_validation);
        }

        let mut vars = base_vars();
        vars.insert("ALLOW_ALL".to_string(), "true".to_string());
        vars.insert("DISABLE_JWT_VALIDATION".to_string(), "true".to_string());
        let config = Config::from_vars(&vars).unwrap();
        assert!(config.allow_all);
        assert!(config.disable_jwt_validation);
    }

    #[test]
    fn test_algorithms_reject_hmac() {
        let mut vars = base_vars();
        vars.insert(
            "JWT_ALLOWED_ALGORITHMS".to_string(),
            "RS256,HS256".to_string(),
        );

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidAlgorithms(msg)) if msg.contains("asymmetric algorithms only"))
        );
    }

    #[test]
    fn test_algorithms_reject_unknown_and_none() {
        for value in ["none", "RS1024", ""] {
            let mut vars = base_vars();
            vars.insert("JWT_ALLOWED_ALGORITHMS".to_string(), value.to_string());

            let result = Config::from_vars(&vars);
            assert!(
                matches!(result, Err(ConfigError::InvalidAlgorithms(_))),
                "{value:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_jwt_clock_skew_accepts_zero() {
        let mut vars = base_vars();
        vars.insert("JWT_CLOCK_SKEW_SECONDS".to_string(), "0".to_string());

        let config = Config::from_vars(&vars).expect("zero leeway should be accepted");
        assert_eq!(config.jwt_clock_skew, Duration::ZERO);
    }

    #[test]
    fn test_jwt_clock_skew_rejects_negative() {
        let mut vars = base_vars();
        vars.insert("JWT_CLOCK_SKEW_SECONDS".to_string(), "-1".to_string());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidJwtClockSkew(msg)) if msg.contains("must not be negative"))
        );
    }

    #[test]
    fn test_jwt_clock_skew_rejects_too_large() {
        let mut vars = base_vars();
        vars.insert("JWT_CLOCK_SKEW_SECONDS".to_string(), "601".to_string());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidJwtClockSkew(msg)) if msg.contains("must not exceed 600"))
        );
    }

    #[test]
    fn test_jwt_clock_skew_rejects_non_numeric() {
        let mut vars = base_vars();
        vars.insert(
            "JWT_CLOCK_SKEW_SECONDS".to_string(),
            "five-minutes".to_string(),
        );

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidJwtClockSkew(msg)) if msg.contains("must be a valid integer"))
        );
    }

    #[test]
    fn test_decision_timeout_bounds() {
        let mut vars = base_vars();
        vars.insert("DECISION_TIMEOUT_SECONDS".to_string(), "0".to_string());
        assert!(
            matches!(Config::from_vars(&vars), Err(ConfigError::InvalidDecisionTimeout(msg)) if msg.contains("must be greater than 0"))
        );

        vars.insert("DECISION_TIMEOUT_SECONDS".to_string(), "61".to_string());
        assert!(
            matches!(Config::from_vars(&vars), Err(ConfigError::InvalidDecisionTimeout(msg)) if msg.contains("must not exceed 60"))
        );
    }

    #[test]
    fn test_jwks_settings_reject_non_numeric() {
        let mut vars = base_vars();
        vars.insert("JWKS_CACHE_TTL_SECONDS".to_string(), "hour".to_string());
        assert!(
            matches!(Config::from_vars(&vars), Err(ConfigError::InvalidJwksCache(msg)) if msg.contains("must be a valid positive integer"))
        );

        let mut vars = base_vars();
        vars.insert("JWKS_REQUESTS_PER_MINUTE".to_string(), "0".to_string());
        assert!(
            matches!(Config::from_vars(&vars), Err(ConfigError::InvalidJwksRateLimit(msg)) if msg.contains("must be greater than 0"))
        );
    }

    #[test]
    fn test_empty_scopes_rejected() {
        let mut vars = base_vars();
        vars.insert("DOWNSTREAM_SCOPES".to_string(), " , ".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidScopes(_))
        ));
    }

    #[test]
    fn test_debug_redacts_client_secret() {
        let mut vars = base_vars();
        vars.insert("CLIENT_ID".to_string(), "client-123".to_string());
        vars.insert("CLIENT_SECRET".to_string(), "super-secret-value".to_string());
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{:?}", config);

        assert!(debug_output.contains("[REDACTED]"));
        assert!(debug_output.contains("client-123"));
        assert!(!debug_output.contains("super-secret-value"));
    }
}

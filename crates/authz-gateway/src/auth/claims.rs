//! Claims attached to an authorized request.
//!
//! Identity providers put arbitrary claims in their tokens and the policy
//! may look at any of them, so claims are kept as an open JSON map with
//! accessors for the registered names. The `sub` value is redacted in Debug
//! output to keep it out of logs.

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// Claims produced by the token verifier.
///
/// `trusted` is true only when the signature, issuer and audience were
/// checked. Claims from the insecure development verifier carry `false`.
/// Serializes as the bare claim map.
#[derive(Clone, Serialize)]
#[serde(transparent)]
pub struct VerifiedClaims {
    claims: Map<String, Value>,

    #[serde(skip)]
    trusted: bool,
}

impl VerifiedClaims {
    pub(crate) fn verified(claims: Map<String, Value>) -> Self {
        Self {
            claims,
            trusted: true,
        }
    }

    pub(crate) fn unverified(claims: Map<String, Value>) -> Self {
        Self {
            claims,
            trusted: false,
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn subject(&self) -> Option<&str> {
        self.get_str("sub")
    }

    pub fn issuer(&self) -> Option<&str> {
        self.get_str("iss")
    }

    /// Audience values; a single-string `aud` yields one element.
    pub fn audience(&self) -> Vec<&str> {
        match self.claims.get("aud") {
            Some(Value::String(aud)) => vec![aud.as_str()],
            Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Expiration timestamp (Unix epoch seconds).
    pub fn expiry(&self) -> Option<i64> {
        self.get("exp").and_then(Value::as_i64)
    }

    /// Issued-at timestamp (Unix epoch seconds).
    pub fn issued_at(&self) -> Option<i64> {
        self.get("iat").and_then(Value::as_i64)
    }

    /// Delegated scopes, from `scp` or `scope` (space-separated).
    pub fn scopes(&self) -> Vec<&str> {
        self.get_str("scp")
            .or_else(|| self.get_str("scope"))
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    fn get_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }
}

impl fmt::Debug for VerifiedClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.claims.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("VerifiedClaims")
            .field("sub", &"[REDACTED]")
            .field("iss", &self.issuer())
            .field("exp", &self.expiry())
            .field("claim_names", &names)
            .field("trusted", &self.trusted)
            .finish()
    }
}

/// Outcome of a successful authorization, stored in request extensions.
///
/// `claims` is `None` for anonymous requests the policy allowed, and for
/// requests let through by the allow-all switch.
#[derive(Debug, Clone, Default)]
pub struct Authorization {
    pub claims: Option<VerifiedClaims>,
}

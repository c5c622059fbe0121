//! Bearer token verification.
//!
//! Verifies inbound JWTs against keys from the identity provider's key set.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (via `common::jwt`)
//! - Only asymmetric algorithms are accepted; HMAC and `none` cannot be
//!   configured
//! - The verifying algorithm is the resolved key's algorithm. The header
//!   `alg` is only checked for membership in the allowed set and never
//!   picks the scheme
//! - `exp`, `nbf`, `iss` and optionally `aud` are validated with no leeway
//!   unless one is configured; `iat` may sit up to five minutes ahead
//! - Insecure mode skips every check and tags claims as untrusted

use crate::auth::claims::VerifiedClaims;
use crate::auth::jwks::{KeyResolveError, KeyResolver};
use crate::observability::metrics;
use common::jwt::{
    decode_unverified_payload, extract_kid, validate_iat, DEFAULT_CLOCK_SKEW, IAT_CLOCK_SKEW,
    MAX_CLOCK_SKEW,
};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

/// Token verification failures.
///
/// These messages are for logs only; clients always get the generic
/// invalid-token response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("malformed token")]
    MalformedToken,

    #[error("token algorithm not allowed")]
    UnsupportedAlgorithm,

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("issuer mismatch")]
    IssuerMismatch,

    #[error("audience mismatch")]
    AudienceMismatch,

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("signing key unavailable: {0}")]
    Key(#[from] KeyResolveError),
}

impl VerifyError {
    fn outcome(&self) -> &'static str {
        match self {
            VerifyError::MalformedToken => "malformed",
            VerifyError::UnsupportedAlgorithm => "unsupported_algorithm",
            VerifyError::SignatureInvalid => "bad_signature",
            VerifyError::IssuerMismatch => "issuer_mismatch",
            VerifyError::AudienceMismatch => "audience_mismatch",
            VerifyError::Expired => "expired",
            VerifyError::NotYetValid => "not_yet_valid",
            VerifyError::Key(KeyResolveError::KeyNotFound(_)) => "unknown_key",
            VerifyError::Key(KeyResolveError::KeyFetch(_)) => "key_fetch_error",
            VerifyError::Key(KeyResolveError::RateLimited) => "key_rate_limited",
        }
    }
}

/// Invalid verification policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("at least one signing algorithm must be allowed")]
    NoAlgorithms,

    #[error("symmetric algorithm {0:?} cannot be used to verify third-party tokens")]
    SymmetricAlgorithm(Algorithm),

    #[error("clock skew must not exceed {} seconds", MAX_CLOCK_SKEW.as_secs())]
    ClockSkewTooLarge,
}

/// What a token must satisfy to be accepted.
#[derive(Debug, Clone)]
pub struct VerificationPolicy {
    allowed_algorithms: Vec<Algorithm>,
    issuer: String,
    audience: Option<String>,
    clock_skew: Duration,
    insecure_skip_verification: bool,
}

impl VerificationPolicy {
    /// Build a policy requiring `issuer` and one of `algorithms`.
    ///
    /// # Errors
    ///
    /// Rejects an empty algorithm list and any HMAC algorithm.
    pub fn new(
        issuer: impl Into<String>,
        algorithms: impl IntoIterator<Item = Algorithm>,
    ) -> Result<Self, PolicyError> {
        let mut allowed_algorithms = Vec::new();
        for algorithm in algorithms {
            if matches!(
                algorithm,
                Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
            ) {
                return Err(PolicyError::SymmetricAlgorithm(algorithm));
            }
            if !allowed_algorithms.contains(&algorithm) {
                allowed_algorithms.push(algorithm);
            }
        }

        if allowed_algorithms.is_empty() {
            return Err(PolicyError::NoAlgorithms);
        }

        Ok(Self {
            allowed_algorithms,
            issuer: issuer.into(),
            audience: None,
            clock_skew: DEFAULT_CLOCK_SKEW,
            insecure_skip_verification: false,
        })
    }

    /// Require `aud` to contain this value. Without it audience is not checked.
    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Leeway applied to `exp` and `nbf`. Zero by default.
    pub fn with_clock_skew(mut self, clock_skew: Duration) -> Result<Self, PolicyError> {
        if clock_skew > MAX_CLOCK_SKEW {
            return Err(PolicyError::ClockSkewTooLarge);
        }
        self.clock_skew = clock_skew;
        Ok(self)
    }

    /// Skip all cryptographic checks. Development only.
    #[must_use]
    pub fn insecure_skip_verification(mut self, enabled: bool) -> Self {
        self.insecure_skip_verification = enabled;
        self
    }

    pub fn allows(&self, algorithm: Algorithm) -> bool {
        self.allowed_algorithms.contains(&algorithm)
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn audience(&self) -> Option<&str> {
        self.audience.as_deref()
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure_skip_verification
    }

    fn validation_for(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.leeway = self.clock_skew.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience.as_str()]),
            None => validation.validate_aud = false,
        }
        validation
    }
}

/// Verifies bearer tokens against a policy and the key resolver.
pub struct TokenVerifier {
    resolver: Arc<KeyResolver>,
    policy: VerificationPolicy,
}

impl TokenVerifier {
    pub fn new(resolver: Arc<KeyResolver>, policy: VerificationPolicy) -> Self {
        if policy.is_insecure() {
            tracing::warn!(
                target: "gatehouse.auth.jwt",
                "JWT signature verification is DISABLED; tokens will be accepted unverified"
            );
        }
        Self { resolver, policy }
    }

    pub fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }

    /// Verify a token and return its claims.
    ///
    /// # Security Checks
    ///
    /// 1. Size check and `kid` extraction
    /// 2. Header `alg` must be in the allowed set
    /// 3. Key resolution by `kid`
    /// 4. Key algorithm must be in the allowed set; it is the only scheme tried
    /// 5. Signature, `exp`, `nbf`, `iss`, `aud`
    /// 6. `iat` no further ahead than the larger of the leeway and five minutes
    ///
    /// # Errors
    ///
    /// Returns the first failing check as a `VerifyError`.
    #[instrument(skip_all)]
    pub async fn verify(&self, token: &str) -> Result<VerifiedClaims, VerifyError> {
        if self.policy.insecure_skip_verification {
            return Ok(self.decode_insecure(token));
        }

        let result = self.verify_signed(token).await;
        match &result {
            Ok(_) => {
                metrics::record_token_verification("success");
                tracing::debug!(target: "gatehouse.auth.jwt", "Token validated successfully");
            }
            Err(e) => {
                metrics::record_token_verification(e.outcome());
                tracing::debug!(target: "gatehouse.auth.jwt", error = %e, "Token verification failed");
            }
        }
        result
    }

    async fn verify_signed(&self, token: &str) -> Result<VerifiedClaims, VerifyError> {
        let kid = extract_kid(token).map_err(|e| {
            tracing::debug!(target: "gatehouse.auth.jwt", error = ?e, "Token kid extraction failed");
            VerifyError::MalformedToken
        })?;

        let header = decode_header(token).map_err(|_| VerifyError::MalformedToken)?;
        if !self.policy.allows(header.alg) {
            tracing::debug!(target: "gatehouse.auth.jwt", alg = ?header.alg, "Token algorithm not allowed");
            return Err(VerifyError::UnsupportedAlgorithm);
        }

        let key = self.resolver.resolve(&kid).await?;
        if !self.policy.allows(key.algorithm) || key.algorithm != header.alg {
            tracing::warn!(
                target: "gatehouse.auth.jwt",
                kid = %kid,
                header_alg = ?header.alg,
                key_alg = ?key.algorithm,
                "Token algorithm does not match signing key"
            );
            return Err(VerifyError::UnsupportedAlgorithm);
        }

        let validation = self.policy.validation_for(key.algorithm);
        let token_data =
            decode::<Map<String, Value>>(token, &key.key, &validation).map_err(|e| {
                match e.kind() {
                    ErrorKind::InvalidSignature
                    | ErrorKind::InvalidEcdsaKey
                    | ErrorKind::InvalidRsaKey(_)
                    | ErrorKind::Crypto(_) => VerifyError::SignatureInvalid,
                    ErrorKind::ExpiredSignature => VerifyError::Expired,
                    ErrorKind::ImmatureSignature => VerifyError::NotYetValid,
                    ErrorKind::InvalidIssuer => VerifyError::IssuerMismatch,
                    ErrorKind::InvalidAudience => VerifyError::AudienceMismatch,
                    ErrorKind::InvalidAlgorithm => VerifyError::UnsupportedAlgorithm,
                    ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => {
                        VerifyError::IssuerMismatch
                    }
                    ErrorKind::MissingRequiredClaim(claim) if claim == "aud" => {
                        VerifyError::AudienceMismatch
                    }
                    _ => VerifyError::MalformedToken,
                }
            })?;

        let claims = token_data.claims;
        if let Some(iat) = claims.get("iat").and_then(Value::as_i64) {
            let iat_skew = self.policy.clock_skew.max(IAT_CLOCK_SKEW);
            validate_iat(iat, iat_skew).map_err(|e| {
                tracing::debug!(target: "gatehouse.auth.jwt", error = ?e, "Token iat validation failed");
                VerifyError::NotYetValid
            })?;
        }

        Ok(VerifiedClaims::verified(claims))
    }

    /// Structural decode with no checks at all.
    ///
    /// A token that does not decode becomes `{"sub": <token>}`.
    fn decode_insecure(&self, token: &str) -> VerifiedClaims {
        tracing::warn!(
            target: "gatehouse.auth.jwt",
            "Accepting token WITHOUT signature verification (DISABLE_JWT_VALIDATION=true)"
        );
        metrics::record_token_verification("unverified");

        match decode_unverified_payload(token) {
            Ok(claims) => VerifiedClaims::unverified(claims),
            Err(_) => {
                let mut claims = Map::new();
                claims.insert("sub".to_string(), Value::String(token.to_string()));
                VerifiedClaims::unverified(claims)
            }
        }
    }
}

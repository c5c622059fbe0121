//! Structural JWT helpers shared by the gateway and the refresh scheduler.
//!
//! Nothing in this module verifies a signature. These helpers only look at
//! the token's shape:
//! - size limit applied before any parsing
//! - `kid` extraction from the header, used to pick a signing key
//! - unverified payload decoding, used for expiry scheduling and the
//!   explicitly insecure development verifier
//! - `iat` validation with clock skew tolerance, applied after verification
//!
//! # Security
//!
//! Claims returned by [`decode_unverified_payload`] are attacker controlled.
//! They may drive scheduling decisions on a client that already holds the
//! token, but must never be treated as proof of identity.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum accepted JWT size in bytes (8KB).
///
/// Tokens above this size are rejected before base64 decoding or any
/// cryptographic work. Typical identity tokens are 1-2KB; 8KB leaves room for
/// group claims while bounding per-request allocation.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default leeway for `exp` and `nbf` checks.
///
/// Zero: a token is rejected from the second its `exp` passes.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::ZERO;

/// Minimum tolerance for an `iat` in the future (5 minutes).
pub const IAT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Upper bound on configurable clock skew (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors produced by structural JWT inspection.
///
/// Display strings are deliberately identical; the variant carries the detail
/// and is logged at debug level only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds [`MAX_JWT_SIZE_BYTES`].
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Not three dot-separated segments, bad base64url, or bad JSON.
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Header has no non-empty string `kid`.
    #[error("The access token is invalid or expired")]
    MissingKid,

    /// `iat` lies further in the future than the clock skew allows.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,
}

// =============================================================================
// Functions
// =============================================================================

/// Split a compact JWT into its header, payload and signature segments.
fn segments(token: &str) -> Result<(&str, &str, &str), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(payload), Some(signature), None) => Ok((header, payload, signature)),
        _ => {
            tracing::debug!(target: "common.jwt", "Token rejected: invalid JWT format");
            Err(JwtValidationError::MalformedToken)
        }
    }
}

/// Decode one base64url segment into a JSON object.
///
/// Trailing `=` padding is tolerated since some issuers emit it.
fn decode_segment(segment: &str) -> Result<Map<String, Value>, JwtValidationError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| {
            tracing::debug!(target: "common.jwt", error = %e, "Failed to decode JWT segment base64");
            JwtValidationError::MalformedToken
        })?;

    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => {
            tracing::debug!(target: "common.jwt", "JWT segment is not a JSON object");
            Err(JwtValidationError::MalformedToken)
        }
        Err(e) => {
            tracing::debug!(target: "common.jwt", error = %e, "Failed to parse JWT segment JSON");
            Err(JwtValidationError::MalformedToken)
        }
    }
}

/// Extract the `kid` (key ID) from a JWT header without verifying the signature.
///
/// The returned value is only good for looking a key up in a trusted key set;
/// the token must still be verified against that key.
///
/// # Errors
///
/// - `TokenTooLarge` if the token exceeds [`MAX_JWT_SIZE_BYTES`]
/// - `MalformedToken` if the header is not a base64url JSON object
/// - `MissingKid` if the header has no non-empty string `kid`
pub fn extract_kid(token: &str) -> Result<String, JwtValidationError> {
    let (header, _, _) = segments(token)?;
    let header = decode_segment(header)?;

    header
        .get("kid")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or(JwtValidationError::MissingKid)
}

/// Decode a token's payload into an open claim map without any signature check.
///
/// # Errors
///
/// - `TokenTooLarge` if the token exceeds [`MAX_JWT_SIZE_BYTES`]
/// - `MalformedToken` if the token is not three segments or the payload is not
///   a base64url-encoded JSON object
pub fn decode_unverified_payload(token: &str) -> Result<Map<String, Value>, JwtValidationError> {
    let (_, payload, _) = segments(token)?;
    decode_segment(payload)
}

/// Read the `exp` claim (Unix seconds) from a token without verifying it.
///
/// Returns `None` when the token does not decode or carries no numeric `exp`.
/// Fractional values are truncated.
#[must_use]
pub fn read_expiry(token: &str) -> Option<i64> {
    let claims = decode_unverified_payload(token).ok()?;
    let exp = claims.get("exp")?;

    #[allow(clippy::cast_possible_truncation)]
    exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))
}

/// Validate the `iat` (issued-at) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `JwtValidationError::IatTooFarInFuture` if `iat` is more than
/// `clock_skew` in the future.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    let now = chrono::Utc::now().timestamp();
    validate_iat_at(iat, clock_skew, now)
}

/// Deterministic `iat` validation against an explicit `now` timestamp.
pub(crate) fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    // clock_skew is bounded by MAX_CLOCK_SKEW at configuration time
    #[allow(clippy::cast_possible_wrap)]
    let clock_skew_secs = clock_skew.as_secs() as i64;
    let max_iat = now + clock_skew_secs;

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

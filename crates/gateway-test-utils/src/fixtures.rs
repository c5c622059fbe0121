//! Signing key and token fixtures.
//!
//! Keys are derived from a one-byte seed so every test run signs with the
//! same material.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde_json::{json, Map, Value};

/// Issuer used by the harness configuration.
pub const TEST_ISSUER: &str = "https://login.test.local/test-tenant/v2.0";

/// Audience used by the harness configuration.
pub const TEST_AUDIENCE: &str = "api://gatehouse-test";

/// Deterministic Ed25519 keypair with a key ID.
pub struct TestKeypair {
    kid: String,
    key_pair: Ed25519KeyPair,
    private_key_pkcs8: Vec<u8>,
}

impl TestKeypair {
    pub fn new(seed: u8, kid: &str) -> Self {
        let mut seed_bytes = [0u8; 32];
        seed_bytes[0] = seed;
        for (i, byte) in seed_bytes.iter_mut().enumerate().skip(1) {
            *byte = seed.wrapping_mul(i as u8).wrapping_add(i as u8);
        }

        let key_pair = Ed25519KeyPair::from_seed_unchecked(&seed_bytes)
            .expect("Failed to create test keypair");

        Self {
            kid: kid.to_string(),
            key_pair,
            private_key_pkcs8: build_pkcs8_from_seed(&seed_bytes),
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Public key as a JWKS entry.
    pub fn jwk_json(&self) -> Value {
        json!({
            "kty": "OKP",
            "kid": self.kid,
            "crv": "Ed25519",
            "x": URL_SAFE_NO_PAD.encode(self.key_pair.public_key().as_ref()),
            "alg": "EdDSA",
            "use": "sig"
        })
    }

    /// Sign claims as a regular EdDSA token.
    pub fn sign(&self, claims: &Value) -> String {
        let encoding_key = EncodingKey::from_ed_der(&self.private_key_pkcs8);
        let mut header = Header::new(Algorithm::EdDSA);
        header.typ = Some("JWT".to_string());
        header.kid = Some(self.kid.clone());

        encode(&header, claims, &encoding_key).expect("Failed to sign token")
    }

    /// Sign claims with this Ed25519 key while claiming `alg` in the header.
    ///
    /// Used to build algorithm-confusion tokens that a JWT library would
    /// refuse to produce.
    pub fn sign_with_header_alg(&self, claims: &Value, alg: &str) -> String {
        let header = json!({"alg": alg, "typ": "JWT", "kid": self.kid});
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string()),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );
        let signature = self.key_pair.sign(signing_input.as_bytes());
        format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature.as_ref()))
    }
}

/// Build PKCS#8 v1 document from Ed25519 seed.
fn build_pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
    let mut pkcs8 = Vec::with_capacity(48);

    // SEQUENCE, 46 bytes
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    // version INTEGER 0
    pkcs8.extend_from_slice(&[0x02, 0x01, 0x00]);
    // AlgorithmIdentifier: OID 1.3.101.112 (Ed25519)
    pkcs8.extend_from_slice(&[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70]);
    // privateKey OCTET STRING wrapping the 32-byte seed
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(seed);

    pkcs8
}

/// Builder for test token claims.
///
/// Defaults: `iss` as given, `sub` = "test-user", `iat` = now,
/// `exp` = now + 1 hour. No `aud` unless set.
#[derive(Debug, Clone)]
pub struct TokenBuilder {
    claims: Map<String, Value>,
}

impl TokenBuilder {
    pub fn new(issuer: &str) -> Self {
        let now = chrono::Utc::now().timestamp();
        let mut claims = Map::new();
        claims.insert("iss".to_string(), json!(issuer));
        claims.insert("sub".to_string(), json!("test-user"));
        claims.insert("iat".to_string(), json!(now));
        claims.insert("exp".to_string(), json!(now + 3600));
        Self { claims }
    }

    pub fn subject(self, sub: &str) -> Self {
        self.claim("sub", json!(sub))
    }

    pub fn audience(self, aud: &str) -> Self {
        self.claim("aud", json!(aud))
    }

    /// Set `exp` relative to now; negative values produce expired tokens.
    pub fn expires_in(self, seconds: i64) -> Self {
        let exp = chrono::Utc::now().timestamp() + seconds;
        self.claim("exp", json!(exp))
    }

    pub fn claim(mut self, name: &str, value: Value) -> Self {
        self.claims.insert(name.to_string(), value);
        self
    }

    pub fn without(mut self, name: &str) -> Self {
        self.claims.remove(name);
        self
    }

    pub fn claims(&self) -> Value {
        Value::Object(self.claims.clone())
    }

    pub fn sign(&self, keypair: &TestKeypair) -> String {
        keypair.sign(&self.claims())
    }

    pub fn sign_with_header_alg(&self, keypair: &TestKeypair, alg: &str) -> String {
        keypair.sign_with_header_alg(&self.claims(), alg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_is_deterministic() {
        let a = TestKeypair::new(1, "k");
        let b = TestKeypair::new(1, "k");
        let c = TestKeypair::new(2, "k");

        assert_eq!(a.jwk_json(), b.jwk_json());
        assert_ne!(a.jwk_json()["x"], c.jwk_json()["x"]);
    }

    #[test]
    fn test_signed_token_carries_kid_and_claims() {
        let keypair = TestKeypair::new(1, "test-key-01");
        let token = TokenBuilder::new(TEST_ISSUER)
            .audience(TEST_AUDIENCE)
            .subject("alice")
            .sign(&keypair);

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.kid.as_deref(), Some("test-key-01"));
        assert_eq!(header.alg, Algorithm::EdDSA);

        let payload = token.split('.').nth(1).unwrap();
        let claims: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        assert_eq!(claims["sub"], "alice");
        assert_eq!(claims["aud"], TEST_AUDIENCE);
    }

    #[test]
    fn test_header_alg_override() {
        let keypair = TestKeypair::new(1, "k");
        let token = TokenBuilder::new(TEST_ISSUER).sign_with_header_alg(&keypair, "RS256");

        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(token.split('.').count(), 3);
    }
}

//! Authentication and authorization for inbound requests.
//!
//! # Components
//!
//! - `jwks` - signing key resolution from the identity provider's key set
//! - `rate_limit` - rolling-window budget for key-set fetches
//! - `jwt` - bearer token verification against a `VerificationPolicy`
//! - `claims` - open claim map handed to the policy and to handlers
//! - `pipeline` - verify-then-decide flow run for every protected request

pub mod claims;
pub mod jwks;
pub mod jwt;
pub mod pipeline;
pub mod rate_limit;

pub use claims::{Authorization, VerifiedClaims};
pub use jwks::KeyResolver;
pub use jwt::{TokenVerifier, VerificationPolicy};
pub use pipeline::{Authorizer, RequestContext};

//! Gatehouse authorization gateway library.
//!
//! Gates protected API resources with externally issued bearer tokens plus
//! an external policy decision:
//!
//! - Signing key resolution from the identity provider's key set
//! - Bearer token verification (signature, issuer, audience, lifetime)
//! - Policy decisions from an OPA-compatible decision service
//! - On-behalf-of delegation for downstream API calls
//!
//! # Architecture
//!
//! ```text
//! routes/mod.rs -> middleware/authorize.rs -> auth/pipeline.rs -> auth/jwt.rs -> auth/jwks.rs
//!                                                             \-> services/decision_client.rs
//!               -> handlers/*.rs -> services/{delegation,downstream}.rs
//! ```
//!
//! # Modules
//!
//! - `auth` - Key resolution, token verification, authorization pipeline
//! - `config` - Service configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `handlers` - HTTP request handlers
//! - `middleware` - Authorization gate and HTTP metrics
//! - `observability` - Prometheus metrics
//! - `routes` - Axum router setup
//! - `services` - Decision, delegation and downstream clients

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod routes;
pub mod services;

//! Middleware for the authorization gateway.
//!
//! # Components
//!
//! - `authorize` - verify-then-decide gate for protected routes
//! - `http_metrics` - HTTP request metrics for every response

pub mod authorize;
pub mod http_metrics;

pub use authorize::require_authorization;
pub use http_metrics::http_metrics_middleware;

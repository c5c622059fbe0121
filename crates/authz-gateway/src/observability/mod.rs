//! Observability for the authorization gateway.
//!
//! Provides metrics definitions and the Prometheus recorder setup.

pub mod metrics;

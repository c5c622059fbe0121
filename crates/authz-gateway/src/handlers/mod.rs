//! HTTP request handlers for the authorization gateway.

pub mod api;
pub mod health;
pub mod me;
pub mod metrics;

pub use api::{protected, public};
pub use health::health_check;
pub use me::get_me;
pub use metrics::metrics_handler;

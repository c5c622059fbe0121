//! Clients for the gateway's external dependencies.
//!
//! # Components
//!
//! - `decision_client` - policy decision service (OPA-compatible)
//! - `delegation` - on-behalf-of token exchange with the identity provider
//! - `downstream` - directory API reads made with a delegated token

pub mod decision_client;
pub mod delegation;
pub mod downstream;

pub use decision_client::{Decision, DecisionClient, PolicyDecider};
pub use delegation::{DelegatedToken, DelegationExchanger};
pub use downstream::DownstreamClient;

//! Token plumbing shared by the Gatehouse gateway and its clients.

#![warn(clippy::pedantic)]

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for structural JWT helpers (size limit, kid, unverified payload, iat)
pub mod jwt;

/// Module for session accounts and silent token acquisition
pub mod token_source;

/// Module for proactive per-account token refresh
pub mod refresh_scheduler;

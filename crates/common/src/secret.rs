//! Secret types for values that must never reach a log line.
//!
//! Bearer tokens, refresh credentials, client secrets and delegated tokens are
//! all held as [`SecretString`]. Its `Debug` output is redacted, so structs that
//! derive `Debug` stay safe to trace, and reading the value requires an explicit
//! [`ExposeSecret::expose_secret`] call at the point of use.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct ExchangeRequest {
//!     client_id: String,
//!     assertion: SecretString,
//! }
//!
//! let req = ExchangeRequest {
//!     client_id: "gateway".to_string(),
//!     assertion: SecretString::from("eyJ..."),
//! };
//!
//! assert!(!format!("{req:?}").contains("eyJ"));
//! assert_eq!(req.assertion.expose_secret(), "eyJ...");
//! ```

pub use secrecy::{ExposeSecret, SecretString};

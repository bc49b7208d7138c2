//! Capability tokens for peer connections.
//!
//! A token binds a permission mask (and optionally per-unit grants) to a source
//! network and an expiry, signed with HMAC-SHA256 under a per-host secret.
//! Validity is re-derived on every [`AuthService::authenticate`] call.

pub mod claims;
pub mod error;
pub mod permission;
pub mod secret;
pub mod service;
pub mod token;

pub use claims::{Authorization, Claims, UnitOperation};
pub use error::{AuthError, SecretError};
pub use permission::Permissions;
pub use secret::SecretKey;
pub use service::{AuthService, Grant};
pub use token::Token;

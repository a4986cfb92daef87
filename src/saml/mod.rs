//! SAML Service Provider.
//!
//! SP-initiated SSO, assertion validation, Single Logout and metadata.

pub mod binding;
pub mod config;
pub mod logout;
pub mod metadata;
pub mod provider;

pub use config::SamlConfig;
pub use provider::{MalformedMessage, SamlProvider, SloMessage, SloOutcome};

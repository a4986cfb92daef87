//! Host session management.
//!
//! This module provides persistent session storage backed by redb,
//! with in-memory caching and background cleanup. It stands in for the
//! host application's session: pending SAML request IDs, the SAML subject
//! and the authenticated user all live on a [`Session`].

pub mod cleanup;
pub mod store;
pub mod types;

pub use cleanup::{spawn_cleanup_task, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use store::SessionStore;
pub use types::{SamlSessionData, Session, SessionId};

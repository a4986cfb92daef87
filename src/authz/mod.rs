//! Authorization module.
//!
//! Allow-list checks, role resolution, and the auth controller that hands a
//! mapped identity over to the host session.

pub mod config;
pub mod controller;
pub mod policy;

pub use config::{AuthzConfig, RoleRule, StringList};
pub use controller::{AuthController, AuthStatus, Authenticator, SessionAuthController};
pub use policy::authorize_user_and_groups;

//! Handoff of an authenticated identity into the host session.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::config::AuthzConfig;
use super::policy::resolve_role;
use crate::session::Session;

/// Outcome of an authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Success,
    Failed,
}

impl std::fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStatus::Success => write!(f, "success"),
            AuthStatus::Failed => write!(f, "failed"),
        }
    }
}

/// An authentication mechanism that produced an identity.
pub trait Authenticator {
    /// Short mechanism name, e.g. "saml".
    fn mechanism(&self) -> &'static str;
    fn status(&self) -> AuthStatus;
    fn user(&self) -> Option<&str>;
    fn groups(&self) -> &[String];
}

/// The host application's side of a login.
pub trait AuthController: Send + Sync {
    /// Record who logged in and how.
    fn store_auth_data(&self, session: &mut Session, auth: &dyn Authenticator) -> Result<()>;

    /// Derive the remaining session properties from the stored auth data.
    fn set_session_props(&self, session: &mut Session) -> Result<()>;
}

/// Auth controller that writes straight into the adapter's session record.
pub struct SessionAuthController {
    config: AuthzConfig,
}

impl SessionAuthController {
    pub fn new(config: AuthzConfig) -> Self {
        Self { config }
    }
}

impl AuthController for SessionAuthController {
    fn store_auth_data(&self, session: &mut Session, auth: &dyn Authenticator) -> Result<()> {
        if auth.status() != AuthStatus::Success {
            anyhow::bail!("Refusing to store auth data with status {}", auth.status());
        }

        let user = auth
            .user()
            .ok_or_else(|| anyhow::anyhow!("Authenticator has no user"))?;

        session.user = Some(user.to_string());
        session.groups = auth.groups().to_vec();
        session.auth = Some(auth.mechanism().to_string());
        Ok(())
    }

    fn set_session_props(&self, session: &mut Session) -> Result<()> {
        let role = resolve_role(&self.config.roles, session.user.as_deref(), &session.groups);

        info!(
            user = session.user.as_deref().unwrap_or_default(),
            role = %role,
            groups = session.groups.len(),
            "Session properties set"
        );

        session.role = Some(role);
        Ok(())
    }
}

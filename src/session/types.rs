//! Session types for SAML-authenticated host sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique session identifier (16-byte random value, hex-encoded for storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(rand::random())
    }

    /// Convert to hex string for storage/cookies.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 16 {
            return None;
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Some(Self(arr))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// What the IdP told us about the subject, kept for Single Logout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SamlSessionData {
    /// Raw assertion attributes, multi-valued.
    pub attributes: HashMap<String, Vec<String>>,

    /// Subject NameID.
    pub name_id: String,

    /// NameID format, if the IdP sent one.
    pub name_id_format: Option<String>,

    /// AuthnStatement SessionIndex.
    pub session_index: Option<String>,

    /// Issuer of the assertion.
    pub idp_entity_id: String,
}

/// A host application session.
///
/// Created when the browser starts SSO and filled in as the SAML
/// exchange progresses; `user` is only set once authorization passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session ID (also the cookie value).
    pub id: SessionId,

    /// Session creation time.
    pub created_at: DateTime<Utc>,

    /// Session expiry time.
    pub expires_at: DateTime<Utc>,

    /// Last access time (updated on each request).
    pub last_accessed: DateTime<Utc>,

    /// ID of the AuthnRequest we are waiting on.
    pub authn_request_id: Option<String>,

    /// ID of the LogoutRequest we are waiting on.
    pub logout_request_id: Option<String>,

    /// SAML subject data from the last consumed assertion.
    pub saml: Option<SamlSessionData>,

    /// Authenticated login name.
    pub user: Option<String>,

    /// Groups of the authenticated user.
    pub groups: Vec<String>,

    /// Authentication mechanism that produced `user`.
    pub auth: Option<String>,

    /// Role resolved by the auth controller.
    pub role: Option<String>,
}

impl Session {
    /// Create an empty session that lives for `ttl_secs`.
    pub fn new(ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs as i64),
            last_accessed: now,
            authn_request_id: None,
            logout_request_id: None,
            saml: None,
            user: None,
            groups: Vec::new(),
            auth: None,
            role: None,
        }
    }

    /// Check if the session is expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Update last accessed time.
    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    /// Whether a user has been logged in on this session.
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// NameID of the SAML subject, if any.
    pub fn name_id(&self) -> Option<&str> {
        self.saml.as_ref().map(|s| s.name_id.as_str())
    }
}

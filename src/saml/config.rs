//! SAML Service Provider configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::authz::AuthzConfig;
use crate::session::DEFAULT_CLEANUP_INTERVAL_SECS;

/// Endpoint prefix the adapter is mounted under, relative to `base_url`.
pub const SAML_ROUTE_PREFIX: &str = "auth/saml";

/// Attribute key that collects group memberships.
pub const GROUPS_KEY: &str = "groups";

/// Attribute key that carries the login name.
pub const USER_KEY: &str = "user";

/// Top-level adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamlConfig {
    /// Public root URL of the host application (e.g., "https://reports.example.com").
    pub base_url: String,

    /// This Service Provider.
    #[serde(default)]
    pub sp: SpConfig,

    /// The Identity Provider we trust.
    pub idp: IdpConfig,

    /// Response validation knobs.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Ask the IdP to re-authenticate on every login and log out locally only.
    #[serde(default)]
    pub disable_sso: bool,

    /// SAML attribute name -> identity key ("user", "groups", or any other key).
    #[serde(default)]
    pub attr_mapping: Option<BTreeMap<String, String>>,

    /// Fail loudly when the mapping yields no user or no groups.
    #[serde(default)]
    pub debug: bool,

    /// Who may log in and which role they get.
    #[serde(default)]
    pub authz: AuthzConfig,

    /// Where to send the browser after a successful login.
    #[serde(default = "default_dashboard_path")]
    pub dashboard_path: String,

    /// Where to send the browser when authorization is denied.
    #[serde(default = "default_unauthorized_path")]
    pub unauthorized_path: String,

    /// Session TTL in seconds (default: 8 hours).
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Cookie name for session ID.
    #[serde(default = "default_cookie_name")]
    pub session_cookie_name: String,

    /// Cookie domain (optional, defaults to request host).
    #[serde(default)]
    pub cookie_domain: Option<String>,

    /// Cookie path.
    #[serde(default = "default_cookie_path")]
    pub cookie_path: String,

    /// Require HTTPS for cookies (Secure flag).
    #[serde(default = "default_true")]
    pub cookie_secure: bool,

    /// Set HttpOnly flag on cookies.
    #[serde(default = "default_true")]
    pub cookie_http_only: bool,

    /// SameSite attribute (Strict, Lax or None).
    #[serde(default = "default_same_site")]
    pub cookie_same_site: String,

    /// Session store path (redb database file).
    #[serde(default = "default_session_store_path")]
    pub session_store_path: String,

    /// Cleanup interval in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

/// Service Provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpConfig {
    /// SP Entity ID. Defaults to the metadata URL.
    #[serde(default)]
    pub entity_id: Option<String>,

    /// NameID format to request.
    #[serde(default = "default_name_id_format")]
    pub name_id_format: String,

    /// SP certificate (PEM), published in metadata.
    #[serde(default)]
    pub x509cert: Option<String>,
}

impl Default for SpConfig {
    fn default() -> Self {
        Self {
            entity_id: None,
            name_id_format: default_name_id_format(),
            x509cert: None,
        }
    }
}

/// Identity Provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdpConfig {
    /// IdP Entity ID; assertions must be issued by it.
    pub entity_id: String,

    /// SingleSignOnService location (HTTP-Redirect binding).
    pub sso_url: String,

    /// SingleLogoutService location (HTTP-Redirect binding).
    #[serde(default)]
    pub slo_url: Option<String>,

    /// Where LogoutResponses go, if different from `slo_url`.
    #[serde(default)]
    pub slo_response_url: Option<String>,

    /// IdP signing certificate, PEM or bare base64 DER. Required.
    #[serde(default)]
    pub x509cert: Option<String>,
}

/// Checks applied to incoming SAML messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    /// Reject assertions that carry no signature.
    #[serde(default)]
    pub want_assertions_signed: bool,

    /// Reject responses whose envelope carries no signature.
    #[serde(default)]
    pub want_messages_signed: bool,

    /// Reject responses we did not ask for (IdP-initiated SSO).
    #[serde(default)]
    pub reject_unsolicited_responses: bool,

    /// Clock skew tolerance in seconds.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: i64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            want_assertions_signed: false,
            want_messages_signed: false,
            reject_unsolicited_responses: false,
            clock_skew_secs: default_clock_skew(),
        }
    }
}

fn default_name_id_format() -> String {
    "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified".to_string()
}

fn default_dashboard_path() -> String {
    "show/dashboard".to_string()
}

fn default_unauthorized_path() -> String {
    "auth/unauthorized".to_string()
}

fn default_session_ttl() -> u64 {
    8 * 60 * 60 // 8 hours
}

fn default_cookie_name() -> String {
    "saml_sp_session".to_string()
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_same_site() -> String {
    "Lax".to_string()
}

fn default_clock_skew() -> i64 {
    300 // 5 minutes
}

fn default_session_store_path() -> String {
    "/var/lib/saml-sp/sessions.redb".to_string()
}

fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}

/// Mapping used when `attr_mapping` is not configured.
pub fn default_attr_mapping() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("memberOf".to_string(), GROUPS_KEY.to_string()),
        ("User.email".to_string(), USER_KEY.to_string()),
    ])
}

impl SamlConfig {
    /// Minimal configuration for the given host and IdP.
    pub fn new(base_url: &str, idp_entity_id: &str, idp_sso_url: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            sp: SpConfig::default(),
            idp: IdpConfig {
                entity_id: idp_entity_id.to_string(),
                sso_url: idp_sso_url.to_string(),
                ..Default::default()
            },
            security: SecurityConfig::default(),
            disable_sso: false,
            attr_mapping: None,
            debug: false,
            authz: AuthzConfig::default(),
            dashboard_path: default_dashboard_path(),
            unauthorized_path: default_unauthorized_path(),
            session_ttl_secs: default_session_ttl(),
            session_cookie_name: default_cookie_name(),
            cookie_domain: None,
            cookie_path: default_cookie_path(),
            cookie_secure: true,
            cookie_http_only: true,
            cookie_same_site: default_same_site(),
            session_store_path: default_session_store_path(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: SamlConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err("base_url is required".to_string());
        }

        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            return Err(format!(
                "base_url must be an absolute http(s) URL, got {}",
                self.base_url
            ));
        }

        if self.idp.entity_id.is_empty() {
            return Err("idp.entity_id is required".to_string());
        }

        if self.idp.sso_url.is_empty() {
            return Err("idp.sso_url is required".to_string());
        }

        if self.idp.x509cert.as_deref().map_or(true, |c| c.trim().is_empty()) {
            return Err("idp.x509cert is required to verify IdP signatures".to_string());
        }

        if !matches!(self.cookie_same_site.as_str(), "Strict" | "Lax" | "None") {
            return Err(format!(
                "cookie_same_site must be Strict, Lax or None, got {}",
                self.cookie_same_site
            ));
        }

        Ok(())
    }

    /// Absolute URL for a path under the host application.
    pub fn url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            format!("{}/", base)
        } else {
            format!("{}/{}", base, path)
        }
    }

    /// SP Entity ID, defaulting to the metadata endpoint URL.
    pub fn sp_entity_id(&self) -> String {
        match self.sp.entity_id {
            Some(ref id) if !id.is_empty() => id.clone(),
            _ => self.url(&format!("{}/metadata", SAML_ROUTE_PREFIX)),
        }
    }

    /// Assertion Consumer Service URL.
    pub fn acs_url(&self) -> String {
        self.url(&format!("{}/acs", SAML_ROUTE_PREFIX))
    }

    /// Single Logout Service URL.
    pub fn sls_url(&self) -> String {
        self.url(&format!("{}/sls", SAML_ROUTE_PREFIX))
    }

    /// SSO initiation URL.
    pub fn sso_url(&self) -> String {
        self.url(&format!("{}/sso", SAML_ROUTE_PREFIX))
    }

    /// Whether AuthnRequests carry `ForceAuthn`.
    pub fn force_authn(&self) -> bool {
        self.disable_sso
    }

    /// Effective attribute mapping.
    pub fn attribute_mapping(&self) -> BTreeMap<String, String> {
        self.attr_mapping.clone().unwrap_or_else(default_attr_mapping)
    }

    /// Where LogoutResponses for IdP-initiated logout are sent.
    pub fn idp_slo_response_url(&self) -> Option<&str> {
        self.idp
            .slo_response_url
            .as_deref()
            .or(self.idp.slo_url.as_deref())
    }

    /// Build the session cookie value.
    pub fn build_cookie(&self, session_id: &str) -> String {
        self.cookie_with_max_age(session_id, self.session_ttl_secs)
    }

    /// Build a cookie that makes the browser forget the session.
    pub fn clear_cookie(&self) -> String {
        self.cookie_with_max_age("", 0)
    }

    fn cookie_with_max_age(&self, value: &str, max_age: u64) -> String {
        let mut cookie = format!("{}={}", self.session_cookie_name, value);

        if let Some(ref domain) = self.cookie_domain {
            cookie.push_str(&format!("; Domain={}", domain));
        }

        cookie.push_str(&format!("; Path={}", self.cookie_path));

        if self.cookie_secure {
            cookie.push_str("; Secure");
        }

        if self.cookie_http_only {
            cookie.push_str("; HttpOnly");
        }

        cookie.push_str(&format!("; SameSite={}", self.cookie_same_site));
        cookie.push_str(&format!("; Max-Age={}", max_age));

        cookie
    }

    /// Parse session ID from cookie header.
    pub fn parse_session_cookie(&self, cookie_header: &str) -> Option<String> {
        let prefix = format!("{}=", self.session_cookie_name);
        cookie_header
            .split(';')
            .map(str::trim)
            .find_map(|part| part.strip_prefix(prefix.as_str()))
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

//! SAML attribute to identity mapping.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::authz::{AuthStatus, Authenticator};
use crate::saml::config::{SamlConfig, GROUPS_KEY, USER_KEY};

/// Mechanism name recorded in the session.
pub const SAML_MECHANISM: &str = "saml";

/// Identity derived from assertion attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthData {
    pub user: Option<String>,
    pub groups: Vec<String>,
    /// Values of mapped keys other than user and groups.
    pub extra: BTreeMap<String, String>,
}

impl Authenticator for AuthData {
    fn mechanism(&self) -> &'static str {
        SAML_MECHANISM
    }

    fn status(&self) -> AuthStatus {
        if self.user.is_some() {
            AuthStatus::Success
        } else {
            AuthStatus::Failed
        }
    }

    fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn groups(&self) -> &[String] {
        &self.groups
    }
}

/// Mapping failures, only raised in debug mode.
#[derive(Debug, Error, PartialEq)]
pub enum MappingError {
    #[error("SAML Mapping error: user not found in SAML attributes ({attributes})")]
    UserNotFound { attributes: String },

    #[error("SAML Mapping error: no groups found in SAML attributes ({attributes})")]
    NoGroups { attributes: String },
}

/// Map assertion attributes onto a user, groups and extra keys.
pub fn map_saml_attrs(
    config: &SamlConfig,
    attrs: &HashMap<String, Vec<String>>,
) -> Result<AuthData, MappingError> {
    let mut out = AuthData {
        user: None,
        groups: Vec::new(),
        extra: BTreeMap::new(),
    };

    for (saml_key, mapped_key) in &config.attribute_mapping() {
        let Some(values) = attrs.get(saml_key) else {
            continue;
        };

        match mapped_key.as_str() {
            GROUPS_KEY => out.groups.extend(values.iter().cloned()),
            USER_KEY => out.user = values.first().filter(|v| !v.is_empty()).cloned(),
            other => {
                if let Some(first) = values.first() {
                    out.extra.insert(other.to_string(), first.clone());
                }
            }
        }
    }

    if config.debug {
        if out.user.is_none() {
            return Err(MappingError::UserNotFound {
                attributes: attribute_list(attrs),
            });
        }
        if out.groups.is_empty() {
            return Err(MappingError::NoGroups {
                attributes: attribute_list(attrs),
            });
        }
    }

    Ok(out)
}

fn attribute_list(attrs: &HashMap<String, Vec<String>>) -> String {
    let mut names: Vec<&str> = attrs.keys().map(String::as_str).collect();
    names.sort_unstable();
    names.join(", ")
}

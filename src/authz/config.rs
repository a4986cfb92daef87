//! Authorization configuration.

use serde::{Deserialize, Serialize};

/// A list given either as a JSON array or a comma-separated string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    List(Vec<String>),
    Csv(String),
}

impl StringList {
    /// Trimmed, non-empty entries.
    pub fn items(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            StringList::List(items) => items.iter().map(String::as_str).collect(),
            StringList::Csv(csv) => csv.split(',').collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// One role assignment rule.
///
/// Members are login names, `@group` references, or `*` for everyone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleRule {
    pub role: String,
    pub members: Vec<String>,
}

/// Authorization configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthzConfig {
    /// Users allowed to log in (case-insensitive).
    #[serde(default, alias = "mr_allowed_users")]
    pub allowed_users: Option<StringList>,

    /// Groups whose members may log in.
    #[serde(default, alias = "mr_allowed_groups")]
    pub allowed_groups: Option<StringList>,

    /// Ordered role rules; the first match wins.
    #[serde(default)]
    pub roles: Vec<RoleRule>,
}

impl AuthzConfig {
    /// Configured user allow-list, empty when unset.
    pub fn allowed_users(&self) -> Vec<String> {
        self.allowed_users
            .as_ref()
            .map(StringList::items)
            .unwrap_or_default()
    }

    /// Configured group allow-list, empty when unset.
    pub fn allowed_groups(&self) -> Vec<String> {
        self.allowed_groups
            .as_ref()
            .map(StringList::items)
            .unwrap_or_default()
    }

    /// True when no allow-list is configured at all.
    pub fn is_unrestricted(&self) -> bool {
        self.allowed_users.is_none() && self.allowed_groups.is_none()
    }
}

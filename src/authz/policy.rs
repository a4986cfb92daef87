//! Allow-list authorization and role resolution.

use tracing::debug;

use super::config::{AuthzConfig, RoleRule};

/// Role given when no rule matches.
pub const NO_ROLE: &str = "nobody";

/// Decide whether a mapped identity may log in.
///
/// With no allow-list configured everyone is admitted. Otherwise the user
/// must appear in the user list (case-insensitive) or share at least one
/// group with the group list.
pub fn authorize_user_and_groups(config: &AuthzConfig, user: Option<&str>, groups: &[String]) -> bool {
    if config.is_unrestricted() {
        return true;
    }

    if let Some(user) = user {
        let user = user.to_lowercase();
        if config
            .allowed_users()
            .iter()
            .any(|allowed| allowed.to_lowercase() == user)
        {
            debug!(user = %user, "User is on the allow-list");
            return true;
        }
    }

    let allowed_groups = config.allowed_groups();
    if let Some(group) = groups.iter().find(|g| allowed_groups.contains(g)) {
        debug!(group = %group, "Group is on the allow-list");
        return true;
    }

    false
}

/// Resolve the role for a user from ordered rules.
pub fn resolve_role(rules: &[RoleRule], user: Option<&str>, groups: &[String]) -> String {
    let user = user.map(str::to_lowercase);

    for rule in rules {
        let matched = rule.members.iter().any(|member| {
            if member == "*" {
                return true;
            }
            if let Some(group) = member.strip_prefix('@') {
                return groups.iter().any(|g| g == group);
            }
            user.as_deref() == Some(member.to_lowercase().as_str())
        });

        if matched {
            return rule.role.clone();
        }
    }

    NO_ROLE.to_string()
}

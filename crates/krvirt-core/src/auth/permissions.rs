//! Role and permission checks over cached user info.
//!
//! All checks are pure; an absent user fails every check.

use serde_json::Value;

use super::models::UserInfo;

/// Permission string that satisfies every check
pub const WILDCARD: &str = "*";

/// Role granted to users holding `admin` or the wildcard
pub const ADMIN_ROLE: &str = "administrator";

/// Role for everyone else
pub const USER_ROLE: &str = "user";

pub fn has_permission(user: Option<&UserInfo>, permission: &str) -> bool {
    user.is_some_and(|u| u.permissions.iter().any(|p| p == WILDCARD || p == permission))
}

pub fn has_role(user: Option<&UserInfo>, role: &str) -> bool {
    user.is_some_and(|u| u.role == role)
}

pub fn is_admin(user: Option<&UserInfo>) -> bool {
    has_role(user, ADMIN_ROLE)
}

/// Permission names from the login payload's `permission` field.
///
/// The backend sends a map of permission name to grant flag; older builds
/// send a plain list. Names are deduplicated, first occurrence wins.
pub fn parse_permissions(permission: &Value) -> Vec<String> {
    let names: Vec<&str> = match permission {
        Value::Object(map) => map.keys().map(String::as_str).collect(),
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };

    let mut unique: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !unique.iter().any(|existing| existing == name) {
            unique.push(name.to_string());
        }
    }
    unique
}

pub fn derive_role(permission: &Value) -> String {
    let privileged = parse_permissions(permission)
        .iter()
        .any(|p| p == "admin" || p == WILDCARD);
    if privileged {
        ADMIN_ROLE.to_string()
    } else {
        USER_ROLE.to_string()
    }
}

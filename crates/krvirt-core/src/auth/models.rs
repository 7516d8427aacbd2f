//! Session data types.
//!
//! `UserInfo` is persisted as JSON with camelCase keys so the browser console
//! and this crate read the same stored value.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity and grants of the logged-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserInfo {
    pub username: String,
    pub role: String,
    pub permissions: Vec<String>,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub last_login: DateTime<Utc>,
    #[serde(default)]
    pub is_first_login: bool,
}

/// Partial update for [`UserInfo`]. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub role: Option<String>,
    pub permissions: Option<Vec<String>>,
    pub last_login: Option<DateTime<Utc>>,
    pub is_first_login: Option<bool>,
}

impl UserUpdate {
    pub fn apply(self, user: &mut UserInfo) {
        if let Some(username) = self.username {
            user.username = username;
        }
        if let Some(role) = self.role {
            user.role = role;
        }
        if let Some(permissions) = self.permissions {
            user.permissions = permissions;
        }
        if let Some(last_login) = self.last_login {
            user.last_login = last_login;
        }
        if let Some(is_first_login) = self.is_first_login {
            user.is_first_login = is_first_login;
        }
    }
}

/// Credentials for `POST /user/login`. Field names match the backend.
#[derive(Clone, Serialize)]
pub struct LoginRequest {
    pub login_name: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub two_factor: Option<String>,
}

impl LoginRequest {
    pub fn new(login_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login_name: login_name.into(),
            password: password.into(),
            two_factor: None,
        }
    }

    pub fn with_two_factor(mut self, code: impl Into<String>) -> Self {
        self.two_factor = Some(code.into());
        self
    }
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("login_name", &self.login_name)
            .field("password", &"<redacted>")
            .field("two_factor", &self.two_factor.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Successful login payload.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LoginResponse {
    pub access_token: Option<String>,
    #[serde(default)]
    pub permission: serde_json::Value,
    #[serde(default)]
    pub is_first_time_login: bool,
}

/// Token renewal payload.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RenewResponse {
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TotpSecretResponse {
    pub totp_secret: String,
}

/// Why an auth operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum AuthErrorKind {
    /// Transport failed or timed out.
    Network,
    /// The server rejected field values (422).
    Validation,
    /// The server refused the credentials.
    Rejected,
    /// The server declared the token invalid.
    AuthInvalid,
    /// A success response was unreadable or missing required fields.
    MalformedResponse,
    /// There is no token to work with.
    MissingToken,
    /// The stored token is structurally unusable.
    InvalidToken,
    /// Another refresh is already in flight.
    RefreshInProgress,
    /// The session was replaced or cleared while a refresh was in flight;
    /// its outcome was dropped.
    Superseded,
    /// Credentials could not be written to or read from the store.
    Storage,
}

/// Outcome of login, logout, and refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct AuthResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub require_reauth: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AuthErrorKind>,
}

impl AuthResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            token: None,
            user: None,
            require_reauth: false,
            error: None,
        }
    }

    pub fn failure(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            token: None,
            user: None,
            require_reauth: false,
            error: Some(kind),
        }
    }

    /// The session is gone server-side; only a fresh login recovers.
    pub fn reauth(message: impl Into<String>) -> Self {
        Self {
            require_reauth: true,
            ..Self::failure(AuthErrorKind::AuthInvalid, message)
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_user(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }
}

/// Outcome of the secondary account calls (TOTP setup, password change).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult<T = ()> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ActionResult<T> {
    pub fn ok(message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Where the session is in its lifecycle.
///
/// The store holds a token exactly when the state is `Authenticating`,
/// `Authenticated`, or `Refreshing` (modulo a pre-existing session during a
/// fresh login attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    RequireReauth,
}

impl SessionState {
    pub fn has_credentials(&self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Refreshing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::Refreshing => "refreshing",
            SessionState::RequireReauth => "require_reauth",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> UserInfo {
        UserInfo {
            username: "test_user".to_string(),
            role: "user".to_string(),
            permissions: vec!["vm.read".to_string()],
            last_login: Utc::now(),
            is_first_login: true,
        }
    }

    #[test]
    fn test_user_info_uses_camel_case_keys() {
        let json = serde_json::to_value(sample_user()).unwrap();
        assert!(json.get("lastLogin").is_some());
        assert_eq!(json["isFirstLogin"], true);
    }

    #[test]
    fn test_user_info_first_login_defaults_to_false() {
        let user: UserInfo = serde_json::from_str(
            r#"{"username":"a","role":"user","permissions":[],"lastLogin":"2025-06-10T11:30:00Z"}"#,
        )
        .unwrap();
        assert!(!user.is_first_login);
    }

    #[test]
    fn test_user_update_only_touches_set_fields() {
        let mut user = sample_user();
        UserUpdate {
            is_first_login: Some(false),
            ..UserUpdate::default()
        }
        .apply(&mut user);
        assert!(!user.is_first_login);
        assert_eq!(user.username, "test_user");
        assert_eq!(user.permissions, vec!["vm.read".to_string()]);
    }

    #[test]
    fn test_login_request_wire_format() {
        let plain = serde_json::to_value(LoginRequest::new("admin", "pw")).unwrap();
        assert_eq!(plain, serde_json::json!({"login_name": "admin", "password": "pw"}));

        let with_code = serde_json::to_value(LoginRequest::new("admin", "pw").with_two_factor("123456")).unwrap();
        assert_eq!(with_code["two_factor"], "123456");
    }

    #[test]
    fn test_login_request_debug_hides_secrets() {
        let rendered = format!("{:?}", LoginRequest::new("admin", "hunter2").with_two_factor("123456"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("123456"));
    }

    #[test]
    fn test_auth_result_serialization_skips_empty_fields() {
        let json = serde_json::to_value(AuthResult::ok("done")).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "message": "done"}));

        let json = serde_json::to_value(AuthResult::reauth("gone")).unwrap();
        assert_eq!(json["requireReauth"], true);
        assert_eq!(json["error"], "auth_invalid");
    }
}

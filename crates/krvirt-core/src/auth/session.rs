//! Login, logout, token renewal, and "who am I" for the console session.
//!
//! `AuthSession` owns no timers. The refresh scheduler drives
//! [`AuthSession::refresh_token`]; UI code calls the rest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::classifier::{ErrorClassifier, Failure, FailureClass, KeywordClassifier};
use super::models::{
    ActionResult, AuthErrorKind, AuthResult, LoginRequest, LoginResponse, RenewResponse,
    SessionState, TotpSecretResponse, UserInfo, UserUpdate,
};
use super::permissions;
use crate::api::{ApiError, ApiResponse, HttpClient, RequestOptions};
use crate::store::{CredentialStore, StoreError};

// ============================================================================
// Constants
// ============================================================================

pub const LOGIN_PATH: &str = "/user/login";
pub const LOGOUT_PATH: &str = "/user/logout";
pub const RENEW_PATH: &str = "/user/renew_access_token";
pub const TOTP_SECRET_PATH: &str = "/user/change_totp_secret";
pub const CHANGE_PASSWORD_PATH: &str = "/user/change_password";

const LOGIN_OK: &str = "login successful";
const LOGIN_FAILED: &str = "login failed";
const LOGIN_REJECTED: &str = "incorrect username or password";
const LOGIN_MALFORMED: &str = "login response malformed";
const LOGOUT_OK: &str = "logout successful";
const REFRESH_OK: &str = "token refreshed";
const NO_VALID_TOKEN: &str = "no valid token";
const INVALID_TOKEN_FORMAT: &str = "invalid token format, local data cleared";
const REFRESH_MALFORMED: &str = "refresh response malformed";
const TOKEN_INVALID: &str = "token invalid, please re-login";
const REFRESH_NETWORK: &str = "refresh request failed, check network";
const REFRESH_BUSY: &str = "refresh already in progress";
const REFRESH_SUPERSEDED: &str = "session changed during refresh";

/// Length of a TOTP code.
const TOTP_CODE_LEN: usize = 6;

/// Phrases the backend uses for bad credentials. Any of these collapse to one
/// message so callers cannot tell an unknown user from a wrong password.
const CREDENTIAL_REJECTION_HINTS: &[&str] = &["username or password", "unauthorized", "401", "用户名或密码"];

// Holds the in-flight flag; clears it on drop whatever the outcome.
struct RefreshGuard<'a>(&'a AtomicBool);

impl<'a> RefreshGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct AuthSession {
    client: Arc<dyn HttpClient>,
    store: CredentialStore,
    classifier: Arc<dyn ErrorClassifier>,
    refreshing: AtomicBool,
    state: Mutex<SessionState>,
    last_failure: Mutex<Option<Failure>>,
}

impl AuthSession {
    pub fn new(client: Arc<dyn HttpClient>, store: CredentialStore) -> Self {
        let state = if Self::has_session(&store) {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        };
        debug!(backend = store.backend_name(), state = %state, "Auth session created");
        Self {
            client,
            store,
            classifier: Arc::new(KeywordClassifier::default()),
            refreshing: AtomicBool::new(false),
            state: Mutex::new(state),
            last_failure: Mutex::new(None),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    fn has_session(store: &CredentialStore) -> bool {
        let has_token = store.token().is_some_and(|t| !t.trim().is_empty());
        has_token && store.user::<UserInfo>().is_some()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!(from = %*state, to = %next, "Session state changed");
            *state = next;
        }
    }

    /// Re-derive the state from what the store holds.
    fn settle_state(&self) {
        let next = if self.is_authenticated() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        };
        self.set_state(next);
    }

    /// Current lifecycle state. A session whose credentials vanished from the
    /// store (another instance logged out) reads as `Unauthenticated`.
    pub fn state(&self) -> SessionState {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.has_credentials() && self.store.token().is_none() {
            return SessionState::Unauthenticated;
        }
        state
    }

    /// The failure behind the most recent unsuccessful renewal, if the last
    /// renewal failed.
    pub fn last_refresh_failure(&self) -> Option<Failure> {
        self.last_failure.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record_failure(&self, failure: Option<Failure>) {
        *self.last_failure.lock().unwrap_or_else(PoisonError::into_inner) = failure;
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Bearer options for calls made on behalf of the logged-in user.
    fn authed_options(&self) -> RequestOptions {
        match self.store.token() {
            Some(token) if !token.is_empty() => RequestOptions::new().bearer(&token),
            _ => RequestOptions::new(),
        }
    }

    // ===== Login / Logout =====

    fn normalize_rejection(message: &str) -> String {
        let lowered = message.to_lowercase();
        if CREDENTIAL_REJECTION_HINTS.iter().any(|hint| lowered.contains(hint)) {
            LOGIN_REJECTED.to_string()
        } else if message.trim().is_empty() {
            format!("{}, check username and password", LOGIN_FAILED)
        } else {
            message.to_string()
        }
    }

    fn persist(&self, token: &str, user: &UserInfo) -> Result<(), StoreError> {
        self.store.set_token(token)?;
        self.store.set_user(user)
    }

    /// Exchange credentials for a token and persist the session.
    ///
    /// A rejected or failed login leaves any existing session in place.
    pub async fn login(&self, request: &LoginRequest) -> AuthResult {
        info!(login_name = %request.login_name, "Logging in");
        self.set_state(SessionState::Authenticating);

        let body = match serde_json::to_value(request) {
            Ok(body) => body,
            Err(e) => {
                self.settle_state();
                return AuthResult::failure(AuthErrorKind::Validation, format!("{}: {}", LOGIN_FAILED, e));
            }
        };
        let options = RequestOptions::new()
            .skip_auth()
            .quiet()
            .success_message(LOGIN_OK)
            .error_message(LOGIN_FAILED);

        let response = match self.client.post(LOGIN_PATH, body, options).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Login request failed");
                self.settle_state();
                let kind = match &e {
                    ApiError::Validation(_) => AuthErrorKind::Validation,
                    _ => AuthErrorKind::Network,
                };
                return AuthResult::failure(kind, format!("{}: {}", LOGIN_FAILED, e));
            }
        };

        if !response.success {
            self.settle_state();
            if response.status == Some(422) {
                debug!(message = %response.message, "Login rejected by validation");
                return AuthResult::failure(
                    AuthErrorKind::Validation,
                    format!("{}: {}", LOGIN_FAILED, response.message),
                );
            }
            debug!(status = ?response.status, "Login rejected");
            let message = if response.status == Some(401) {
                LOGIN_REJECTED.to_string()
            } else {
                Self::normalize_rejection(&response.message)
            };
            return AuthResult::failure(AuthErrorKind::Rejected, message);
        }

        let (token, permission, is_first_login) = match response.data_as::<LoginResponse>() {
            Some(LoginResponse { access_token: Some(token), permission, is_first_time_login })
                if !token.trim().is_empty() =>
            {
                (token, permission, is_first_time_login)
            }
            _ => {
                warn!("Login response missing access_token");
                self.settle_state();
                return AuthResult::failure(AuthErrorKind::MalformedResponse, LOGIN_MALFORMED);
            }
        };

        let user = UserInfo {
            username: request.login_name.clone(),
            role: permissions::derive_role(&permission),
            permissions: permissions::parse_permissions(&permission),
            last_login: Utc::now(),
            is_first_login,
        };

        if let Err(e) = self.persist(&token, &user) {
            error!(error = %e, "Failed to persist session after login");
            if let Err(e) = self.store.clear_auth() {
                error!(error = %e, "Failed to roll back partial session");
            }
            self.settle_state();
            return AuthResult::failure(AuthErrorKind::Storage, format!("{}: {}", LOGIN_FAILED, e));
        }

        self.set_state(SessionState::Authenticated);
        info!(username = %user.username, role = %user.role, first_login = user.is_first_login, "Login successful");
        AuthResult::ok(LOGIN_OK).with_token(token).with_user(user)
    }

    /// Best-effort server logout, then unconditional local clear.
    pub async fn logout(&self) -> AuthResult {
        if let Some(token) = self.store.token().filter(|t| !t.is_empty()) {
            let options = RequestOptions::new().quiet().bearer(&token).error_message("logout failed");
            match self.client.post(LOGOUT_PATH, json!({}), options).await {
                Ok(response) if response.success => debug!("Server session closed"),
                Ok(response) => debug!(message = %response.message, "Server logout rejected"),
                Err(e) => debug!(error = %e, "Server logout failed"),
            }
        }

        self.clear_local();
        self.set_state(SessionState::Unauthenticated);
        info!("Logged out");
        AuthResult::ok(LOGOUT_OK)
    }

    fn clear_local(&self) {
        if let Err(e) = self.store.clear_auth() {
            error!(error = %e, "Failed to clear stored credentials");
        }
    }

    /// Drop local credentials because the server no longer honours them.
    pub(crate) fn invalidate(&self) {
        self.clear_local();
        self.set_state(SessionState::RequireReauth);
    }

    // ===== Token Refresh =====

    /// Renew the stored token.
    ///
    /// At most one renewal runs at a time: a call made while another is in
    /// flight returns `RefreshInProgress` without touching the network.
    pub async fn refresh_token(&self) -> AuthResult {
        let token = match self.store.token() {
            Some(token) => token,
            None => return AuthResult::failure(AuthErrorKind::MissingToken, NO_VALID_TOKEN),
        };

        if token.trim().is_empty() {
            warn!("Stored token is empty, clearing local session");
            self.clear_local();
            self.set_state(SessionState::Unauthenticated);
            return AuthResult::failure(AuthErrorKind::InvalidToken, INVALID_TOKEN_FORMAT);
        }

        let _guard = match RefreshGuard::acquire(&self.refreshing) {
            Some(guard) => guard,
            None => {
                debug!("Refresh already in flight, skipping");
                return AuthResult::failure(AuthErrorKind::RefreshInProgress, REFRESH_BUSY);
            }
        };

        self.set_state(SessionState::Refreshing);
        let options = RequestOptions::new()
            .skip_auth()
            .quiet()
            .bearer(&token);

        let outcome = self.client.get(RENEW_PATH, &[], options).await;

        // A logout or a fresh login while the request was out means this
        // answer is about a token the store no longer holds.
        if self.store.token().as_deref() != Some(token.as_str()) {
            debug!("Stored token changed during refresh, discarding result");
            self.settle_state();
            return AuthResult::failure(AuthErrorKind::Superseded, REFRESH_SUPERSEDED);
        }

        match outcome {
            Ok(response) if response.success => self.apply_renewal(&response),
            Ok(response) => self.handle_refresh_failure(Failure::from_response(&response)),
            Err(ApiError::InvalidResponse(detail)) => {
                warn!(detail = %detail, "Refresh response unreadable");
                self.set_state(SessionState::Authenticated);
                AuthResult::failure(AuthErrorKind::MalformedResponse, REFRESH_MALFORMED)
            }
            Err(e) => {
                debug!(error = %e, "Refresh request errored");
                self.handle_refresh_failure(Failure::from_error(&e))
            }
        }
    }

    fn apply_renewal(&self, response: &ApiResponse) -> AuthResult {
        let renewed = response
            .data_as::<RenewResponse>()
            .and_then(|r| r.access_token)
            .filter(|t| !t.trim().is_empty());

        let new_token = match renewed {
            Some(token) => token,
            None => {
                // The old token may still be good; only the renewal was unreadable.
                warn!("Refresh response missing access_token");
                self.set_state(SessionState::Authenticated);
                return AuthResult::failure(AuthErrorKind::MalformedResponse, REFRESH_MALFORMED);
            }
        };

        if let Err(e) = self.store.set_token(&new_token) {
            error!(error = %e, "Failed to persist renewed token");
            self.set_state(SessionState::Authenticated);
            return AuthResult::failure(AuthErrorKind::Storage, format!("token refresh failed: {}", e));
        }

        if let Some(mut user) = self.current_user() {
            user.last_login = Utc::now();
            if let Err(e) = self.store.set_user(&user) {
                warn!(error = %e, "Failed to bump last login after refresh");
            }
        }

        self.record_failure(None);
        self.set_state(SessionState::Authenticated);
        debug!(token_len = new_token.len(), "Token refreshed");
        AuthResult::ok(REFRESH_OK).with_token(new_token)
    }

    fn handle_refresh_failure(&self, failure: Failure) -> AuthResult {
        let class = self.classifier.classify(&failure);
        self.record_failure(Some(failure.clone()));
        match class {
            FailureClass::ReauthRequired => {
                warn!(status = ?failure.status, message = %failure.message, "Token rejected by server, clearing session");
                self.invalidate();
                AuthResult::reauth(TOKEN_INVALID)
            }
            class => {
                debug!(status = ?failure.status, message = %failure.message, class = ?class, "Refresh failed, will retry");
                self.set_state(SessionState::Authenticated);
                AuthResult::failure(AuthErrorKind::Network, REFRESH_NETWORK)
            }
        }
    }

    /// Clear a stored token that can never be valid. Returns whether anything
    /// was cleared.
    pub fn cleanup_invalid_token(&self) -> bool {
        match self.store.token() {
            Some(token) if token.trim().is_empty() => {
                warn!("Found invalid token, clearing");
                self.clear_local();
                self.set_state(SessionState::Unauthenticated);
                true
            }
            _ => false,
        }
    }

    // ===== Identity =====

    /// Token and user both present. A token alone does not count.
    pub fn is_authenticated(&self) -> bool {
        Self::has_session(&self.store)
    }

    pub fn current_user(&self) -> Option<UserInfo> {
        self.store.user()
    }

    pub fn token(&self) -> Option<String> {
        self.store.token()
    }

    pub fn set_user(&self, user: &UserInfo) -> Result<(), StoreError> {
        self.store.set_user(user)
    }

    pub fn set_token(&self, token: &str) -> Result<(), StoreError> {
        self.store.set_token(token)
    }

    /// Merge `update` into the cached user. `Ok(false)` when there is no
    /// cached user; nothing is written in that case.
    pub fn update_user(&self, update: UserUpdate) -> Result<bool, StoreError> {
        let Some(mut user) = self.current_user() else {
            return Ok(false);
        };
        update.apply(&mut user);
        self.store.set_user(&user)?;
        Ok(true)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        permissions::has_permission(self.current_user().as_ref(), permission)
    }

    pub fn has_role(&self, role: &str) -> bool {
        permissions::has_role(self.current_user().as_ref(), role)
    }

    pub fn is_admin(&self) -> bool {
        permissions::is_admin(self.current_user().as_ref())
    }

    pub fn is_first_time_login(&self) -> bool {
        self.current_user().is_some_and(|u| u.is_first_login)
    }

    pub fn update_first_time_login_status(&self, is_first_login: bool) -> Result<(), StoreError> {
        self.update_user(UserUpdate {
            is_first_login: Some(is_first_login),
            ..UserUpdate::default()
        })
        .map(|_| ())
    }

    // ===== First-time Login Flow =====

    /// Ask the server for a fresh TOTP secret for the current user.
    pub async fn generate_totp_secret(&self) -> ActionResult<String> {
        let options = self
            .authed_options()
            .success_message("totp secret generated")
            .error_message("totp secret generation failed");
        match self.client.post(TOTP_SECRET_PATH, json!({}), options).await {
            Ok(response) if response.success => match response.data_as::<TotpSecretResponse>() {
                Some(secret) => ActionResult::ok(response.message, Some(secret.totp_secret)),
                None => ActionResult::failed("totp secret response malformed"),
            },
            Ok(response) => ActionResult::failed(response.message),
            Err(e) => ActionResult::failed(format!("totp secret generation failed: {}", e)),
        }
    }

    /// The backend has no verification endpoint, so this only checks shape.
    pub fn verify_totp_code(&self, code: &str) -> ActionResult {
        if code.len() == TOTP_CODE_LEN && code.chars().all(|c| c.is_ascii_digit()) {
            ActionResult::ok("totp code format ok", None)
        } else {
            ActionResult::failed(format!("totp code must be {} digits", TOTP_CODE_LEN))
        }
    }

    /// Set the permanent password during first-time login. On success the
    /// cached user stops being a first-time login.
    pub async fn change_password_first_time(&self, new_password: &str) -> ActionResult {
        let options = self
            .authed_options()
            .success_message("password changed")
            .error_message("password change failed");
        let body = json!({ "new_password": new_password });
        match self.client.post(CHANGE_PASSWORD_PATH, body, options).await {
            Ok(response) if response.success => {
                if let Err(e) = self.update_first_time_login_status(false) {
                    warn!(error = %e, "Failed to clear first-login flag");
                }
                ActionResult::ok(response.message, None)
            }
            Ok(response) => ActionResult::failed(response.message),
            Err(e) => ActionResult::failed(format!("password change failed: {}", e)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

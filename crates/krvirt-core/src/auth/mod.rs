//! Authentication and identity.
//!
//! This module provides:
//! - `AuthSession`: login, logout, token renewal, and user/permission lookups
//! - `ErrorClassifier`: decides whether a failed renewal means the session is dead
//! - Permission helpers and the result types returned to callers

pub mod classifier;
pub mod models;
pub mod permissions;
pub mod session;

pub use classifier::{ErrorClassifier, Failure, FailureClass, KeywordClassifier};
pub use models::{
    ActionResult, AuthErrorKind, AuthResult, LoginRequest, SessionState, UserInfo, UserUpdate,
};
pub use session::AuthSession;

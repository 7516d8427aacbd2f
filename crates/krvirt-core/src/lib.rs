//! Session core for the KR-Virt console.
//!
//! - [`store`]: token and user persistence behind pluggable backends
//! - [`auth`]: login, logout, renewal, and permission checks
//! - [`refresh`]: the periodic renewal scheduler and its events
//! - [`api`]: the HTTP transport contract and a reqwest implementation
//! - [`context`]: wires one session and one scheduler together
//!
//! The library never installs a tracing subscriber; that is the
//! application's job.

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod refresh;
pub mod store;

pub use api::{ApiError, ApiResponse, HttpClient, RequestOptions, RestClient};
pub use auth::{
    AuthErrorKind, AuthResult, AuthSession, ErrorClassifier, KeywordClassifier, LoginRequest,
    SessionState, UserInfo, UserUpdate,
};
pub use config::{Config, StorageKind};
pub use context::AuthContext;
pub use refresh::{ReauthReason, RefreshSettings, SchedulerStatus, SessionEvent, TokenRefreshScheduler};
pub use store::{CredentialStore, StoreError, StoreOptions};

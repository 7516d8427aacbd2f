//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use krvirt_core::{ApiError, ApiResponse, CredentialStore, HttpClient, RequestOptions, UserInfo};
use serde_json::{json, Value};
use tracing_subscriber::{fmt, EnvFilter};

/// Route library logs to stderr. `RUST_LOG=debug cargo test` to see them.
/// Safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn sample_user(username: &str) -> UserInfo {
    UserInfo {
        username: username.to_string(),
        role: "user".to_string(),
        permissions: vec!["vm.read".to_string()],
        last_login: Utc::now(),
        is_first_login: false,
    }
}

/// An in-memory store already holding a session for `test_user`.
pub fn logged_in_store(token: &str) -> CredentialStore {
    let store = CredentialStore::in_memory();
    store.set_token(token).unwrap();
    store.set_user(&sample_user("test_user")).unwrap();
    store
}

type Responder = Box<dyn Fn(usize) -> Result<ApiResponse, ApiError> + Send + Sync>;

/// Backend double whose renewal endpoint answers from a script and can be
/// made slow. The argument to the script is the zero-based call index.
pub struct ScriptedClient {
    delay: Duration,
    renew: Responder,
    renew_calls: AtomicUsize,
    posts: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(renew: impl Fn(usize) -> Result<ApiResponse, ApiError> + Send + Sync + 'static) -> Self {
        Self {
            delay: Duration::ZERO,
            renew: Box::new(renew),
            renew_calls: AtomicUsize::new(0),
            posts: AtomicUsize::new(0),
        }
    }

    /// Renewal always succeeds with `T<n+2>`: T2, T3, ...
    pub fn renewing() -> Self {
        Self::new(|n| Ok(ApiResponse::ok(json!({ "access_token": format!("T{}", n + 2) }))))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn renew_calls(&self) -> usize {
        self.renew_calls.load(Ordering::SeqCst)
    }

    pub fn posts(&self) -> usize {
        self.posts.load(Ordering::SeqCst)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl HttpClient for ScriptedClient {
    async fn get(
        &self,
        _path: &str,
        _params: &[(String, String)],
        _options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let n = self.renew_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.renew)(n)
    }

    async fn post(&self, path: &str, _body: Value, _options: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.posts.fetch_add(1, Ordering::SeqCst);
        if path == "/user/login" {
            return Ok(ApiResponse::ok(json!({
                "access_token": "T1",
                "permission": {"user": true},
                "is_first_time_login": false,
            })));
        }
        Ok(ApiResponse::ok(json!({})))
    }
}

//! Application-wide auth wiring.
//!
//! `AuthContext` owns the single [`AuthSession`] and its
//! [`TokenRefreshScheduler`], and keeps the scheduler in step with login
//! state. UI code should go through here rather than driving the two
//! separately.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::api::{HttpClient, RestClient};
use crate::auth::{AuthResult, AuthSession, LoginRequest};
use crate::config::Config;
use crate::refresh::{RefreshSettings, SessionEvent, TokenRefreshScheduler};
use crate::store::CredentialStore;

#[derive(Clone)]
pub struct AuthContext {
    session: Arc<AuthSession>,
    scheduler: TokenRefreshScheduler,
}

impl AuthContext {
    pub fn new(session: Arc<AuthSession>, settings: RefreshSettings) -> Self {
        let scheduler = TokenRefreshScheduler::new(session.clone(), settings);
        Self { session, scheduler }
    }

    /// Build the client, store, session, and scheduler from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = config.open_store()?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: &Config, store: CredentialStore) -> Result<Self> {
        let client = RestClient::with_timeout(&config.api_base_url, config.request_timeout())?
            .with_credentials(store.clone());
        let client: Arc<dyn HttpClient> = Arc::new(client);
        let session = Arc::new(AuthSession::new(client, store));
        Ok(Self::new(session, config.refresh_settings()))
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    pub fn scheduler(&self) -> &TokenRefreshScheduler {
        &self.scheduler
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.scheduler.subscribe()
    }

    /// Log in and, on success, restart renewal for the new token.
    pub async fn login(&self, request: &LoginRequest) -> AuthResult {
        let result = self.session.login(request).await;
        if result.success {
            self.scheduler.stop();
            self.scheduler.start();
        }
        result
    }

    pub async fn logout(&self) -> AuthResult {
        self.scheduler.stop();
        self.session.logout().await
    }

    /// Pick up a session persisted by an earlier run. Returns whether
    /// renewal is running afterwards.
    pub fn resume(&self) -> bool {
        if self.session.cleanup_invalid_token() {
            info!("Discarded unusable stored session");
        }
        if !self.session.is_authenticated() {
            debug!("No stored session to resume");
            return false;
        }
        self.scheduler.start();
        self.scheduler.status().is_running()
    }

    /// The console became visible again. Timers may have been suspended while
    /// hidden, so make sure renewal is running for a live session.
    pub fn on_visible(&self) {
        if self.session.is_authenticated() && !self.scheduler.status().is_running() {
            debug!("Restarting token refresh after visibility change");
            self.scheduler.start();
        }
    }
}

//! Periodic token renewal.
//!
//! One scheduler per application, owned by [`crate::context::AuthContext`].
//! Each tick spawns a renewal and returns; a tick that finds a renewal still
//! in flight is skipped, not queued.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::events::{ReauthReason, SessionEvent};
use crate::auth::{AuthErrorKind, AuthResult, AuthSession};

/// Default renewal period in seconds.
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;

/// Buffered events per subscriber before the oldest are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSettings {
    pub interval: Duration,
    /// Consecutive failed renewals after which the session is dropped.
    /// `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            max_consecutive_failures: None,
        }
    }
}

/// Snapshot of the scheduler for diagnostics and UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SchedulerStatus {
    Stopped,
    Running { refreshing: bool },
}

impl SchedulerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, SchedulerStatus::Running { .. })
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self, SchedulerStatus::Running { refreshing: true })
    }
}

enum TimerState {
    Stopped,
    Running { ticker: JoinHandle<()> },
}

struct Inner {
    session: Arc<AuthSession>,
    settings: RefreshSettings,
    timer: Mutex<TimerState>,
    consecutive_failures: AtomicU32,
    events: broadcast::Sender<SessionEvent>,
}

/// Handle to the refresh scheduler. Clones share the same timer.
#[derive(Clone)]
pub struct TokenRefreshScheduler {
    inner: Arc<Inner>,
}

impl TokenRefreshScheduler {
    pub fn new(session: Arc<AuthSession>, settings: RefreshSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                session,
                settings,
                timer: Mutex::new(TimerState::Stopped),
                consecutive_failures: AtomicU32::new(0),
                events,
            }),
        }
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Arm the timer. Returns `false` (and changes nothing) when already
    /// running or when called outside a tokio runtime.
    pub fn start(&self) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            warn!("No tokio runtime, token refresh scheduler not started");
            return false;
        };

        let mut timer = self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*timer, TimerState::Running { .. }) {
            warn!("Token refresh scheduler already running");
            return false;
        }

        self.inner.consecutive_failures.store(0, Ordering::Relaxed);
        let ticker = runtime.spawn(Self::run_ticker(
            Arc::downgrade(&self.inner),
            self.inner.settings.interval,
        ));
        *timer = TimerState::Running { ticker };
        info!(interval_secs = self.inner.settings.interval.as_secs(), "Token refresh scheduler started");
        true
    }

    /// Cancel future ticks. A renewal already in flight runs to completion.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// `refreshing` reflects any renewal on the session, including ones
    /// started outside the scheduler.
    pub fn status(&self) -> SchedulerStatus {
        let timer = self.inner.timer.lock().unwrap_or_else(PoisonError::into_inner);
        match *timer {
            TimerState::Stopped => SchedulerStatus::Stopped,
            TimerState::Running { .. } => SchedulerStatus::Running {
                refreshing: self.inner.session.is_refreshing(),
            },
        }
    }

    /// Renew now, outside the timer. `None` when skipped because a renewal
    /// is already in flight or there is no session, or when the session was
    /// replaced before the renewal finished.
    pub async fn refresh_now(&self) -> Option<AuthResult> {
        self.inner.perform_refresh().await
    }

    async fn run_ticker(inner: Weak<Inner>, period: Duration) {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            // Every handle is gone; nothing left to refresh for.
            let Some(inner) = inner.upgrade() else {
                break;
            };
            tokio::spawn(async move {
                inner.perform_refresh().await;
            });
        }
    }
}

impl Inner {
    fn stop(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if let TimerState::Running { ticker } = std::mem::replace(&mut *timer, TimerState::Stopped) {
            ticker.abort();
            info!("Token refresh scheduler stopped");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn perform_refresh(&self) -> Option<AuthResult> {
        if !self.session.is_authenticated() {
            debug!("No session to refresh");
            return None;
        }

        let result = self.session.refresh_token().await;

        if result.success {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            self.emit(SessionEvent::Refreshed);
        } else if result.require_reauth {
            self.stop();
            let reason = self
                .session
                .last_refresh_failure()
                .map(|f| ReauthReason::from_failure(&f))
                .unwrap_or(ReauthReason::Other);
            warn!(reason = ?reason, "Session invalidated by server");
            self.emit(SessionEvent::ReauthRequired { reason });
        } else if matches!(
            result.error,
            Some(AuthErrorKind::RefreshInProgress | AuthErrorKind::Superseded)
        ) {
            debug!(message = %result.message, "Refresh skipped");
            return None;
        } else {
            self.record_failure(&result);
        }
        Some(result)
    }

    fn record_failure(&self, result: &AuthResult) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        match self.settings.max_consecutive_failures {
            Some(limit) if failures >= limit => {
                warn!(failures = failures, "Token refresh failed repeatedly, dropping session");
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.session.invalidate();
                self.stop();
                self.emit(SessionEvent::ReauthRequired {
                    reason: ReauthReason::RepeatedFailures,
                });
            }
            _ => {
                debug!(failures = failures, message = %result.message, "Token refresh failed, retrying next tick");
                self.emit(SessionEvent::RefreshFailed {
                    message: result.message.clone(),
                });
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::test::MockHttpClient;
    use crate::api::{ApiError, ApiResponse};
    use crate::auth::UserInfo;
    use crate::store::CredentialStore;
    use chrono::Utc;
    use serde_json::json;

    const PERIOD: Duration = Duration::from_secs(30);

    fn logged_in_session(mock: MockHttpClient) -> Arc<AuthSession> {
        logged_in_session_with(mock, CredentialStore::in_memory())
    }

    fn logged_in_session_with(mock: MockHttpClient, store: CredentialStore) -> Arc<AuthSession> {
        store.set_token("T1").unwrap();
        store
            .set_user(&UserInfo {
                username: "test_user".to_string(),
                role: "user".to_string(),
                permissions: vec![],
                last_login: Utc::now(),
                is_first_login: false,
            })
            .unwrap();
        Arc::new(AuthSession::new(Arc::new(mock), store))
    }

    fn scheduler(session: Arc<AuthSession>, max_failures: Option<u32>) -> TokenRefreshScheduler {
        TokenRefreshScheduler::new(
            session,
            RefreshSettings {
                interval: PERIOD,
                max_consecutive_failures: max_failures,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let scheduler = scheduler(logged_in_session(MockHttpClient::new()), None);
        assert_eq!(scheduler.status(), SchedulerStatus::Stopped);

        assert!(scheduler.start());
        assert!(!scheduler.start());
        assert_eq!(scheduler.status(), SchedulerStatus::Running { refreshing: false });

        scheduler.stop();
        scheduler.stop();
        assert_eq!(scheduler.status(), SchedulerStatus::Stopped);
        assert!(scheduler.start());
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_refreshes_after_one_period() {
        let mut mock = MockHttpClient::new();
        mock.expect_get()
            .returning(|_, _, _| Ok(ApiResponse::ok(json!({"access_token": "T2"}))));
        let session = logged_in_session(mock);
        let scheduler = scheduler(session.clone(), None);
        let mut events = scheduler.subscribe();

        let started = Instant::now();
        scheduler.start();
        let event = events.recv().await.unwrap();

        assert_eq!(event, SessionEvent::Refreshed);
        assert!(started.elapsed() >= PERIOD);
        assert_eq!(session.token().as_deref(), Some("T2"));
        assert!(scheduler.status().is_running());
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_keeps_running() {
        let mut mock = MockHttpClient::new();
        mock.expect_get().returning(|_, _, _| Err(ApiError::Timeout));
        let session = logged_in_session(mock);
        let scheduler = scheduler(session.clone(), None);
        let mut events = scheduler.subscribe();

        scheduler.start();
        for _ in 0..3 {
            assert!(matches!(events.recv().await.unwrap(), SessionEvent::RefreshFailed { .. }));
        }

        assert!(scheduler.status().is_running());
        assert_eq!(session.token().as_deref(), Some("T1"));
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reauth_stops_scheduler() {
        let mut mock = MockHttpClient::new();
        mock.expect_get()
            .times(1)
            .returning(|_, _, _| Ok(ApiResponse::failed(401, "Not authenticated")));
        let session = logged_in_session(mock);
        let scheduler = scheduler(session.clone(), None);
        let mut events = scheduler.subscribe();

        scheduler.start();
        let event = events.recv().await.unwrap();

        assert_eq!(
            event,
            SessionEvent::ReauthRequired {
                reason: ReauthReason::Unauthorized
            }
        );
        assert_eq!(scheduler.status(), SchedulerStatus::Stopped);
        assert!(!session.is_authenticated());

        // No further ticks reach the server.
        time::sleep(PERIOD * 3).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_escalate_when_configured() {
        let mut mock = MockHttpClient::new();
        mock.expect_get()
            .times(2)
            .returning(|_, _, _| Err(ApiError::Timeout));
        let session = logged_in_session(mock);
        let scheduler = scheduler(session.clone(), Some(2));
        let mut events = scheduler.subscribe();

        scheduler.start();
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::RefreshFailed { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ReauthRequired {
                reason: ReauthReason::RepeatedFailures
            }
        );
        assert_eq!(scheduler.status(), SchedulerStatus::Stopped);
        assert_eq!(session.token(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut mock = MockHttpClient::new();
        mock.expect_get().returning(move |_, _, _| {
            // fail, succeed, fail, fail
            match counter.fetch_add(1, Ordering::SeqCst) {
                1 => Ok(ApiResponse::ok(json!({"access_token": "T2"}))),
                _ => Err(ApiError::Timeout),
            }
        });
        let scheduler = scheduler(logged_in_session(mock), Some(2));
        let mut events = scheduler.subscribe();

        scheduler.start();
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::RefreshFailed { .. }));
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Refreshed);
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::RefreshFailed { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::ReauthRequired { reason: ReauthReason::RepeatedFailures }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_without_session_do_nothing() {
        let session = Arc::new(AuthSession::new(
            Arc::new(MockHttpClient::new()),
            CredentialStore::in_memory(),
        ));
        let scheduler = scheduler(session, None);
        let mut events = scheduler.subscribe();

        scheduler.start();
        time::sleep(PERIOD * 3 + Duration::from_secs(1)).await;

        assert!(events.try_recv().is_err());
        assert!(scheduler.status().is_running());
        scheduler.stop();
    }

    #[test]
    fn test_start_outside_runtime() {
        let scheduler = scheduler(logged_in_session(MockHttpClient::new()), None);

        assert!(!scheduler.start());
        assert_eq!(scheduler.status(), SchedulerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_refresh_for_replaced_session_emits_nothing() {
        let store = CredentialStore::in_memory();
        let relogin = store.clone();
        let mut mock = MockHttpClient::new();
        mock.expect_get().returning(move |_, _, _| {
            relogin.set_token("T9").unwrap();
            Ok(ApiResponse::failed(401, "Not authenticated"))
        });
        let session = logged_in_session_with(mock, store);
        let scheduler = scheduler(session.clone(), Some(1));
        let mut events = scheduler.subscribe();

        assert!(scheduler.refresh_now().await.is_none());
        assert!(events.try_recv().is_err());
        assert_eq!(session.token().as_deref(), Some("T9"));
    }

    #[tokio::test]
    async fn test_refresh_now_while_stopped() {
        let mut mock = MockHttpClient::new();
        mock.expect_get()
            .times(1)
            .returning(|_, _, _| Ok(ApiResponse::ok(json!({"access_token": "T2"}))));
        let scheduler = scheduler(logged_in_session(mock), None);

        let result = scheduler.refresh_now().await.unwrap();

        assert!(result.success);
        assert_eq!(scheduler.status(), SchedulerStatus::Stopped);
        assert!(!scheduler.status().is_refreshing());
    }

    #[test]
    fn test_status_invariant() {
        assert!(!SchedulerStatus::Stopped.is_refreshing());
        assert!(SchedulerStatus::Running { refreshing: true }.is_running());
        assert!(!SchedulerStatus::Running { refreshing: false }.is_refreshing());
    }
}

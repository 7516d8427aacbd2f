//! End-to-end session lifecycle: context, session, and scheduler together.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::ScriptedClient;
use krvirt_core::{
    ApiError, ApiResponse, AuthContext, AuthErrorKind, AuthSession, CredentialStore, LoginRequest,
    ReauthReason, RefreshSettings, SchedulerStatus, SessionEvent, TokenRefreshScheduler,
};
use serde_json::json;
use tokio::time;

const PERIOD: Duration = Duration::from_secs(30);

fn settings() -> RefreshSettings {
    RefreshSettings {
        interval: PERIOD,
        max_consecutive_failures: None,
    }
}

fn session(client: &Arc<ScriptedClient>, store: CredentialStore) -> Arc<AuthSession> {
    Arc::new(AuthSession::new(client.clone(), store))
}

#[tokio::test(start_paused = true)]
async fn test_login_refresh_logout() {
    common::init_tracing();
    let client = ScriptedClient::renewing().shared();
    let ctx = AuthContext::new(session(&client, CredentialStore::in_memory()), settings());
    let mut events = ctx.subscribe();

    let login = ctx.login(&LoginRequest::new("test_user", "pw")).await;
    assert!(login.success);
    assert!(ctx.scheduler().status().is_running());

    assert_eq!(events.recv().await.unwrap(), SessionEvent::Refreshed);
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Refreshed);
    assert_eq!(ctx.session().token().as_deref(), Some("T3"));

    let logout = ctx.logout().await;
    assert!(logout.success);
    assert_eq!(ctx.scheduler().status(), SchedulerStatus::Stopped);
    assert!(!ctx.session().is_authenticated());

    // Second logout has nothing to tell the server.
    let posts = client.posts();
    assert!(ctx.logout().await.success);
    assert_eq!(client.posts(), posts);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_refreshes_hit_server_once() {
    let client = ScriptedClient::renewing().with_delay(Duration::from_millis(500)).shared();
    let session = session(&client, common::logged_in_store("T1"));

    let (a, b) = futures::join!(session.refresh_token(), session.refresh_token());

    assert_eq!(client.renew_calls(), 1);
    let (won, lost) = if a.success { (a, b) } else { (b, a) };
    assert!(won.success);
    assert_eq!(lost.error, Some(AuthErrorKind::RefreshInProgress));
    assert_eq!(session.token().as_deref(), Some("T2"));
    assert!(!session.is_refreshing());
}

#[tokio::test(start_paused = true)]
async fn test_manual_refresh_races_scheduled_tick() {
    let client = ScriptedClient::renewing().with_delay(Duration::from_secs(5)).shared();
    let session = session(&client, common::logged_in_store("T1"));
    let scheduler = TokenRefreshScheduler::new(session.clone(), settings());

    let (manual, direct) = futures::join!(scheduler.refresh_now(), session.refresh_token());

    assert_eq!(client.renew_calls(), 1);
    assert!(manual.is_some() || direct.success);
}

#[tokio::test(start_paused = true)]
async fn test_double_start_schedules_one_timer() {
    let client = ScriptedClient::renewing().shared();
    let scheduler = TokenRefreshScheduler::new(session(&client, common::logged_in_store("T1")), settings());

    assert!(scheduler.start());
    assert!(!scheduler.start());
    time::sleep(PERIOD * 3 + Duration::from_secs(1)).await;

    assert_eq!(client.renew_calls(), 3);
    scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn test_slow_refresh_skips_overlapping_ticks() {
    // Each renewal outlives two periods.
    let client = ScriptedClient::renewing().with_delay(PERIOD * 2 + Duration::from_secs(5)).shared();
    let scheduler = TokenRefreshScheduler::new(session(&client, common::logged_in_store("T1")), settings());

    scheduler.start();
    time::sleep(PERIOD + Duration::from_secs(1)).await;
    assert_eq!(scheduler.status(), SchedulerStatus::Running { refreshing: true });

    time::sleep(PERIOD * 2).await;
    assert_eq!(client.renew_calls(), 1);
    scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn test_stop_lets_in_flight_refresh_finish() {
    let client = ScriptedClient::renewing().with_delay(Duration::from_secs(5)).shared();
    let session = session(&client, common::logged_in_store("T1"));
    let scheduler = TokenRefreshScheduler::new(session.clone(), settings());
    let mut events = scheduler.subscribe();

    scheduler.start();
    time::sleep(PERIOD + Duration::from_secs(1)).await;
    assert_eq!(client.renew_calls(), 1);
    scheduler.stop();

    assert_eq!(events.recv().await.unwrap(), SessionEvent::Refreshed);
    assert_eq!(session.token().as_deref(), Some("T2"));
    assert_eq!(scheduler.status(), SchedulerStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_transient_then_fatal_failure() {
    let client = ScriptedClient::new(|n| match n {
        0 => Err(ApiError::Timeout),
        1 => Ok(ApiResponse::failed(500, "Internal Server Error")),
        _ => Ok(ApiResponse::failed(401, "Signature has expired")),
    })
    .shared();
    let ctx = AuthContext::new(session(&client, common::logged_in_store("T1")), settings());
    let mut events = ctx.subscribe();

    assert!(ctx.resume());
    assert!(matches!(events.recv().await.unwrap(), SessionEvent::RefreshFailed { .. }));
    assert!(matches!(events.recv().await.unwrap(), SessionEvent::RefreshFailed { .. }));
    assert_eq!(ctx.session().token().as_deref(), Some("T1"));

    let event = events.recv().await.unwrap();
    assert_eq!(
        event,
        SessionEvent::ReauthRequired {
            reason: ReauthReason::Expired
        }
    );
    assert!(!ctx.session().is_authenticated());
    assert_eq!(ctx.scheduler().status(), SchedulerStatus::Stopped);
    assert_eq!(client.renew_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_visibility_restart_after_stop() {
    let client = ScriptedClient::renewing().shared();
    let ctx = AuthContext::new(session(&client, common::logged_in_store("T1")), settings());

    ctx.scheduler().stop();
    ctx.on_visible();
    assert!(ctx.scheduler().status().is_running());

    time::sleep(PERIOD + Duration::from_secs(1)).await;
    assert_eq!(client.renew_calls(), 1);
    ctx.scheduler().stop();
}

#[tokio::test(start_paused = true)]
async fn test_stale_rejection_does_not_end_new_session() {
    // The first renewal is rejected, but only answers after the user has
    // logged out and back in.
    let client = ScriptedClient::new(|n| match n {
        0 => Ok(ApiResponse::failed(401, "Signature has expired")),
        _ => Ok(ApiResponse::ok(json!({ "access_token": format!("T{}", n + 1) }))),
    })
    .with_delay(Duration::from_secs(5))
    .shared();
    let ctx = AuthContext::new(session(&client, common::logged_in_store("T0")), settings());
    let mut events = ctx.subscribe();

    assert!(ctx.resume());
    time::sleep(PERIOD + Duration::from_secs(1)).await;
    assert_eq!(client.renew_calls(), 1);

    assert!(ctx.logout().await.success);
    assert!(ctx.login(&LoginRequest::new("test_user", "pw")).await.success);
    time::sleep(Duration::from_secs(10)).await;

    assert_eq!(ctx.session().token().as_deref(), Some("T1"));
    assert!(ctx.session().is_authenticated());
    assert!(ctx.scheduler().status().is_running());
    assert!(events.try_recv().is_err());

    // The restarted timer renews the new token as usual.
    assert_eq!(events.recv().await.unwrap(), SessionEvent::Refreshed);
    assert_eq!(ctx.session().token().as_deref(), Some("T2"));
    ctx.scheduler().stop();
}

#[tokio::test(start_paused = true)]
async fn test_status_tracks_refresh_started_elsewhere() {
    let client = ScriptedClient::renewing().with_delay(Duration::from_secs(5)).shared();
    let session = session(&client, common::logged_in_store("T1"));
    let scheduler = TokenRefreshScheduler::new(session.clone(), settings());
    scheduler.start();

    let direct = tokio::spawn({
        let session = session.clone();
        async move { session.refresh_token().await }
    });
    time::sleep(Duration::from_secs(1)).await;

    assert_eq!(scheduler.status(), SchedulerStatus::Running { refreshing: true });
    assert!(scheduler.refresh_now().await.is_none());

    assert!(direct.await.unwrap().success);
    assert_eq!(scheduler.status(), SchedulerStatus::Running { refreshing: false });
    assert_eq!(client.renew_calls(), 1);
    scheduler.stop();
}

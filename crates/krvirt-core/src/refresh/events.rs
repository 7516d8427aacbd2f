//! Session notifications published by the refresh scheduler.

use serde::Serialize;

use crate::auth::Failure;

/// Why the user has to log in again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum ReauthReason {
    Expired,
    Unauthorized,
    Network,
    RepeatedFailures,
    Other,
}

impl ReauthReason {
    /// Best guess from a failure message. Order matters: a message can mention
    /// both a status code and expiry.
    pub fn from_message(message: &str) -> Self {
        let lowered = message.to_lowercase();
        if lowered.contains("network") || message.contains("网络") {
            ReauthReason::Network
        } else if lowered.contains("expired") || message.contains("已失效") || message.contains("过期") {
            ReauthReason::Expired
        } else if ["401", "403", "unauthorized", "forbidden"]
            .iter()
            .any(|hint| lowered.contains(hint))
        {
            ReauthReason::Unauthorized
        } else {
            ReauthReason::Other
        }
    }

    pub fn from_failure(failure: &Failure) -> Self {
        if failure.transport {
            return ReauthReason::Network;
        }
        match Self::from_message(&failure.message) {
            ReauthReason::Expired => ReauthReason::Expired,
            _ if matches!(failure.status, Some(401) | Some(403)) => ReauthReason::Unauthorized,
            other => other,
        }
    }

    /// Text to show before sending the user back to the login page.
    pub fn user_message(&self) -> &'static str {
        match self {
            ReauthReason::Network => {
                "Network connection lost. You are being signed out to protect your account."
            }
            ReauthReason::Expired => "Your login has expired. You are being signed out.",
            ReauthReason::Unauthorized => "Authentication failed. You are being signed out.",
            ReauthReason::RepeatedFailures => {
                "Your session could not be renewed. You are being signed out."
            }
            ReauthReason::Other => "Token verification failed. You are being signed out.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionEvent {
    /// A scheduled or manual renewal stored a new token.
    Refreshed,
    /// A renewal failed but the session is kept; the next tick retries.
    RefreshFailed { message: String },
    /// Credentials were cleared. The UI should route to the login page.
    ReauthRequired { reason: ReauthReason },
}

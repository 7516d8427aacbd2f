//! Failure classification for token refresh.
//!
//! The backend has no machine-readable error code for "this token is dead",
//! so classification falls back to HTTP status and then to keywords in the
//! error message. Keyword matching is fragile across backend versions and
//! locales; swap in a different [`ErrorClassifier`] once typed codes exist.
//!
//! Unmatched failures are `Transient`: dropping a still-valid session over a
//! network blip is worse than retrying a dead one on the next tick.

use crate::api::{ApiError, ApiResponse};

/// What went wrong, reduced to the parts classification looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub status: Option<u16>,
    pub message: String,
    /// The request never got an answer from the server.
    pub transport: bool,
}

impl Failure {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            transport: false,
        }
    }

    pub fn from_response(response: &ApiResponse) -> Self {
        Self::new(response.status, response.message.clone())
    }

    pub fn from_error(error: &ApiError) -> Self {
        match error {
            // Transport errors render the request URL, and the renew URL
            // contains "token". Keep the message generic.
            ApiError::NetworkError(e) => Self {
                status: e.status().map(|s| s.as_u16()),
                message: "network error".to_string(),
                transport: true,
            },
            ApiError::Timeout => Self {
                status: None,
                message: "request timed out".to_string(),
                transport: true,
            },
            // These describe our side of the exchange, not the token. Their
            // text ("Invalid request", "Invalid response") would match keywords.
            ApiError::InvalidRequest(_) | ApiError::InvalidResponse(_) | ApiError::RateLimited => Self {
                status: error.status(),
                message: "request could not be completed".to_string(),
                transport: true,
            },
            other => Self::new(other.status(), other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The session may still be valid. Retry later, keep credentials.
    Transient,
    /// The request was rejected on its fields.
    Validation,
    /// The session is permanently invalid.
    ReauthRequired,
}

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, failure: &Failure) -> FailureClass;
}

/// Substrings that mark a token as dead. Matched against the lower-cased message.
pub const DEFAULT_REAUTH_KEYWORDS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid",
    "expired",
    "decodeerror",
    "token",
    // zh-CN: "has expired", "invalid", "expired"
    "已失效",
    "无效",
    "过期",
];

/// Status-then-keyword classifier.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    keywords: Vec<String>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::with_keywords(DEFAULT_REAUTH_KEYWORDS.iter().copied())
    }
}

impl KeywordClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .collect(),
        }
    }
}

impl ErrorClassifier for KeywordClassifier {
    fn classify(&self, failure: &Failure) -> FailureClass {
        match failure.status {
            Some(401) | Some(403) => return FailureClass::ReauthRequired,
            Some(422) => return FailureClass::Validation,
            _ => {}
        }

        if failure.transport {
            return FailureClass::Transient;
        }

        let message = failure.message.to_lowercase();
        if self.keywords.iter().any(|k| message.contains(k.as_str())) {
            FailureClass::ReauthRequired
        } else {
            FailureClass::Transient
        }
    }
}

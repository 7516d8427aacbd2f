//! The transport contract the session core consumes.
//!
//! Every console service talks to the backend through an [`HttpClient`]. The
//! session core only needs `get` and `post`; the reqwest implementation lives
//! in [`super::rest`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ApiError;

/// Per-request knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Do not attach the stored bearer token. Also keeps the request from
    /// triggering any auth handling of its own.
    pub skip_auth: bool,
    /// Extra headers. These win over headers the client adds itself.
    pub headers: Vec<(String, String)>,
    /// Whether a failure should be surfaced loudly. The session core turns
    /// this off for background calls.
    pub show_error_message: bool,
    pub default_success_message: Option<String>,
    pub default_error_message: Option<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self {
            show_error_message: true,
            ..Self::default()
        }
    }

    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }

    pub fn quiet(mut self) -> Self {
        self.show_error_message = false;
        self
    }

    pub fn success_message(mut self, message: impl Into<String>) -> Self {
        self.default_success_message = Some(message.into());
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.default_error_message = Some(message.into());
        self
    }
}

/// Normalized response envelope.
///
/// `success: false` means the server answered but refused; transport-level
/// failures are an `Err(ApiError)` instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ApiResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: "ok".to_string(),
            data: Some(data),
            status: Some(200),
        }
    }

    pub fn failed(status: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            status: Some(status),
        }
    }

    /// Decode `data` into `T`. `None` when there is no payload or it does not
    /// have the expected shape.
    pub fn data_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.data
            .as_ref()
            .and_then(|data| serde_json::from_value(data.clone()).ok())
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(
        &self,
        path: &str,
        params: &[(String, String)],
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError>;

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError>;
}

//! reqwest-backed [`HttpClient`] for the console backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use super::client::{ApiResponse, HttpClient, RequestOptions};
use super::ApiError;
use crate::store::CredentialStore;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// API client for the console backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    store: Option<CredentialStore>,
    initial_backoff: Duration,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store: None,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// Attach the stored bearer token to requests that do not set `skip_auth`.
    pub fn with_credentials(mut self, store: CredentialStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the rate-limit backoff. Tests use this to avoid real sleeps.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn headers(&self, options: &RequestOptions) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        if !options.skip_auth {
            if let Some(token) = self.store.as_ref().and_then(|s| s.token()) {
                if !token.is_empty() {
                    let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                        .map_err(|e| ApiError::InvalidRequest(format!("bad token header: {}", e)))?;
                    headers.insert(header::AUTHORIZATION, value);
                }
            }
        }

        for (name, value) in &options.headers {
            let name = header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ApiError::InvalidRequest(format!("bad header name {}: {}", name, e)))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|e| ApiError::InvalidRequest(format!("bad header value: {}", e)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    /// Pull a human-readable message out of an error body.
    ///
    /// The backend reports errors as `{"message": ...}` or FastAPI-style
    /// `{"detail": "..."}` / `{"detail": [{"msg": ...}]}`.
    fn error_message(body: &str) -> Option<String> {
        let json: Value = serde_json::from_str(body).ok()?;
        if let Some(message) = json.get("message").and_then(Value::as_str) {
            return Some(message.to_string());
        }
        match json.get("detail")? {
            Value::String(detail) => Some(detail.clone()),
            Value::Array(items) => items
                .iter()
                .find_map(|item| item.get("msg").and_then(Value::as_str))
                .map(str::to_string),
            _ => None,
        }
    }

    async fn into_api_response(
        response: reqwest::Response,
        options: &RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            let data = if body.trim().is_empty() {
                None
            } else {
                Some(serde_json::from_str(&body).map_err(|e| {
                    ApiError::InvalidResponse(format!("body is not JSON: {}", e))
                })?)
            };
            return Ok(ApiResponse {
                success: true,
                message: options
                    .default_success_message
                    .clone()
                    .unwrap_or_else(|| "ok".to_string()),
                data,
                status: Some(status.as_u16()),
            });
        }

        let message = Self::error_message(&body)
            .or_else(|| options.default_error_message.clone())
            .unwrap_or_else(|| ApiError::from_status(status, &body).to_string());
        Ok(ApiResponse::failed(status.as_u16(), message))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        build: impl Fn(RequestBuilder) -> RequestBuilder + Send + Sync,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.url(path);
        let headers = self.headers(&options)?;
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let request = build(self.client.request(method.clone(), &url).headers(headers.clone()));
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let err = ApiError::from(e);
                    if options.show_error_message {
                        warn!(url = %url, error = %err, "Request failed");
                    } else {
                        debug!(url = %url, error = %err, "Request failed");
                    }
                    return Err(err);
                }
            };

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited);
                }
                warn!(url = %url, retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2; // Exponential backoff
                continue;
            }

            let result = Self::into_api_response(response, &options).await?;
            if !result.success {
                if options.show_error_message {
                    warn!(url = %url, status = ?result.status, message = %result.message, "Request rejected");
                } else {
                    debug!(url = %url, status = ?result.status, message = %result.message, "Request rejected");
                }
            }
            return Ok(result);
        }
    }
}

#[async_trait]
impl HttpClient for RestClient {
    async fn get(
        &self,
        path: &str,
        params: &[(String, String)],
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let params = params.to_vec();
        self.send(Method::GET, path, move |request| request.query(&params), options)
            .await
    }

    async fn post(
        &self,
        path: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.send(Method::POST, path, move |request| request.json(&body), options)
            .await
    }
}

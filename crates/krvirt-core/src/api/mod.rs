//! Transport layer for the console backend.
//!
//! This module provides:
//! - `HttpClient`: the `get`/`post` contract the session core is written against
//! - `RestClient`: a reqwest implementation with bearer auth and 429 backoff
//! - `ApiError`: transport failures, mapped from HTTP status where possible
//!
//! Authenticated requests carry `Authorization: Bearer <token>`.

pub mod client;
pub mod error;
pub mod rest;

pub use client::{ApiResponse, HttpClient, RequestOptions};
pub use error::ApiError;
pub use rest::RestClient;

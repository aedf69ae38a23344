#![cfg_attr(not(test), deny(unsafe_code))]
#![warn(
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::missing_docs_in_private_items
)]

//! Resilient HTTP transport for the Google Gemini API.
//!
//! Every request goes through a [`RequestExecutor`]: failures are normalized
//! into one [`ErrorKind`], a [`RetryPolicy`] decides whether and when to try
//! again, and streaming bodies are decoded into JSON values by a
//! [`JsonStreamDecoder`] regardless of how the bytes were chunked.

mod client;
pub mod error;
pub mod executor;
pub mod request_builder;
pub mod retry;
pub mod streaming;
pub mod transport;

pub use client::{DEFAULT_API_VERSION, DEFAULT_BASE_URL, DEFAULT_TIMEOUT, Gemini};
pub use error::{ErrorCategory, ErrorKind, classify_status_code, classify_transport_failure};
pub use executor::{Attempt, RequestExecutor, Transition};
pub use request_builder::{
    AuthMethod, Endpoint, HttpMethod, PreparedRequest, RequestBuilder, RequestConfig,
};
pub use retry::{RetryPolicy, RetryPolicyError};
pub use streaming::{JsonStreamDecoder, decode_json_stream};
pub use transport::{HttpTransport, Transport, TransportFailure, TransportResponse};

/// Re-export common types for convenience
pub use async_trait::async_trait;
pub use futures_util::stream::BoxStream;
#[cfg(feature = "leaky-bucket")]
pub use leaky_bucket::RateLimiter;

use std::fmt;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, TryStreamExt, stream::BoxStream};
use http::{HeaderMap, StatusCode};
use thiserror::Error;

use crate::request_builder::PreparedRequest;

/// Raw failure raised below the HTTP layer, before classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFailure {
    /// DNS failure, refused or reset connection.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The deadline elapsed before the exchange finished.
    #[error("deadline elapsed")]
    Timeout,

    /// A body that should have been JSON could not be decoded.
    #[error("undecodable response body: {0}")]
    Decode(String),

    #[error("transport failure: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportFailure {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// Response body as it arrives from the wire.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportFailure>>;

/// Status, headers and a not-yet-consumed body.
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl TransportResponse {
    /// A response whose body is delivered as the given chunks, in order.
    pub fn from_chunks<I, C>(status: StatusCode, chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        let chunks: Vec<Result<Bytes, TransportFailure>> =
            chunks.into_iter().map(|c| Ok(c.into())).collect();
        Self {
            status,
            headers: HeaderMap::new(),
            body: futures_util::stream::iter(chunks).boxed(),
        }
    }

    /// Reads the remaining body into memory.
    pub async fn collect_body(self) -> Result<Bytes, TransportFailure> {
        self.body
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .map(BytesMut::freeze)
    }
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Anything that can perform one HTTP exchange.
///
/// Implementations must be safe to share between concurrent calls; the
/// executor never serializes access to them.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &PreparedRequest) -> Result<TransportResponse, TransportFailure>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
///
/// Deadlines are enforced by the executor, so no per-request timeout is set
/// here; a long-lived streaming body must not be cut off by the client.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &PreparedRequest) -> Result<TransportResponse, TransportFailure> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes_stream().map_err(TransportFailure::from).boxed();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

use core::fmt;
use std::{sync::Arc, time::Duration};

use bon::Builder;
use futures_util::stream::{self, BoxStream};
#[cfg(feature = "leaky-bucket")]
use leaky_bucket::RateLimiter;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    error::ErrorKind,
    executor::RequestExecutor,
    request_builder::{AuthMethod, Endpoint, HttpMethod, RequestBuilder, RequestConfig},
    retry::RetryPolicy,
    transport::{HttpTransport, Transport},
};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_API_VERSION: &str = "v1beta";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Gemini API client: credentials, endpoint location, deadline and retry policy.
///
/// ```rust,no_run
/// # use gemini_transport_ox::{Gemini, RetryPolicy};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let gemini = Gemini::builder()
///     .api_key("your-api-key")
///     .retry_policy(RetryPolicy::aggressive())
///     .build();
///
/// let response = gemini
///     .generate_content(
///         "gemini-2.0-flash",
///         &serde_json::json!({"contents": [{"parts": [{"text": "Hello"}]}]}),
///     )
///     .await?;
/// println!("{response}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Builder)]
pub struct Gemini {
    #[builder(into)]
    pub(crate) api_key: Option<String>,
    #[builder(into)]
    pub(crate) oauth_token: Option<String>,
    #[builder(default = DEFAULT_BASE_URL.to_string(), into)]
    pub(crate) base_url: String,
    #[builder(default = DEFAULT_API_VERSION.to_string(), into)]
    pub(crate) api_version: String,
    #[builder(default = DEFAULT_TIMEOUT)]
    pub(crate) timeout: Duration,
    #[builder(default)]
    pub(crate) retry_policy: RetryPolicy,
    #[builder(into)]
    pub(crate) user_agent: Option<String>,
    #[builder(default)]
    pub(crate) client: reqwest::Client,
    /// Replaces the `reqwest` transport, e.g. for tests.
    pub(crate) transport: Option<Arc<dyn Transport>>,
    #[cfg(feature = "leaky-bucket")]
    pub(crate) rate_limiter: Option<Arc<RateLimiter>>,
}

impl Default for Gemini {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Gemini {
    /// Create a new Gemini client with the provided API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::builder().api_key(api_key).build()
    }

    /// Create a new Gemini client authenticating with an OAuth access token.
    pub fn with_oauth_token(oauth_token: impl Into<String>) -> Self {
        Self::builder().oauth_token(oauth_token).build()
    }

    /// Reads `GEMINI_API_KEY` (or `GOOGLE_AI_API_KEY`), plus an optional
    /// `GEMINI_BASE_URL` override.
    pub fn load_from_env() -> Result<Self, std::env::VarError> {
        let api_key =
            std::env::var("GEMINI_API_KEY").or_else(|_| std::env::var("GOOGLE_AI_API_KEY"))?;
        let mut gemini = Self::new(api_key);
        if let Ok(base_url) = std::env::var("GEMINI_BASE_URL") {
            gemini.base_url = base_url;
        }
        Ok(gemini)
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Deadline applied to each attempt, not to the whole retry sequence.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// OAuth tokens take precedence over API keys.
    fn auth_method(&self) -> Result<AuthMethod, ErrorKind> {
        if let Some(token) = &self.oauth_token {
            Ok(AuthMethod::Bearer(token.clone()))
        } else if let Some(key) = &self.api_key {
            Ok(AuthMethod::api_key(key.clone()))
        } else {
            Err(ErrorKind::Auth {
                status_code: None,
                message: "no API key or OAuth token provided".to_string(),
            })
        }
    }

    pub(crate) fn request_builder(&self) -> Result<RequestBuilder, ErrorKind> {
        let mut config = RequestConfig::new(self.base_url.clone())
            .with_api_version(self.api_version.clone())
            .with_auth(self.auth_method()?);
        if let Some(user_agent) = &self.user_agent {
            config = config.with_user_agent(user_agent.clone());
        }
        Ok(RequestBuilder::new(config))
    }

    /// Executor sharing this client's transport, policy and deadline.
    #[must_use]
    pub fn executor(&self) -> RequestExecutor {
        let transport = self
            .transport
            .clone()
            .unwrap_or_else(|| Arc::new(HttpTransport::new(self.client.clone())));
        let executor = RequestExecutor::new(transport, self.retry_policy.clone(), self.timeout);

        #[cfg(feature = "leaky-bucket")]
        let executor = match &self.rate_limiter {
            Some(limiter) => executor.with_rate_limiter(Arc::clone(limiter)),
            None => executor,
        };

        executor
    }

    /// Sends `endpoint` with an optional JSON body and returns the parsed response.
    pub async fn send<B>(&self, endpoint: &Endpoint, body: Option<&B>) -> Result<Value, ErrorKind>
    where
        B: Serialize + ?Sized,
    {
        let request = self.request_builder()?.build_request(endpoint, body)?;
        self.executor().execute_unary(&request).await
    }

    pub async fn get(&self, path: &str) -> Result<Value, ErrorKind> {
        self.send::<()>(&Endpoint::new(path, HttpMethod::Get), None).await
    }

    pub async fn post<B>(&self, path: &str, body: &B) -> Result<Value, ErrorKind>
    where
        B: Serialize + ?Sized,
    {
        self.send(&Endpoint::new(path, HttpMethod::Post), Some(body)).await
    }

    pub async fn put<B>(&self, path: &str, body: &B) -> Result<Value, ErrorKind>
    where
        B: Serialize + ?Sized,
    {
        self.send(&Endpoint::new(path, HttpMethod::Put), Some(body)).await
    }

    pub async fn patch<B>(&self, path: &str, body: &B) -> Result<Value, ErrorKind>
    where
        B: Serialize + ?Sized,
    {
        self.send(&Endpoint::new(path, HttpMethod::Patch), Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ErrorKind> {
        self.send::<()>(&Endpoint::new(path, HttpMethod::Delete), None).await
    }

    /// Like [`post`](Self::post), deserializing the response into `T`.
    pub async fn post_as<T, B>(&self, path: &str, body: &B) -> Result<T, ErrorKind>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let value = self.post(path, body).await?;
        serde_json::from_value(value)
            .map_err(|e| ErrorKind::validation(format!("unexpected response shape: {e}")))
    }

    /// POSTs `body` to a streaming endpoint and yields each decoded JSON value.
    pub fn stream<B>(
        &self,
        endpoint: &Endpoint,
        body: Option<&B>,
    ) -> BoxStream<'static, Result<Value, ErrorKind>>
    where
        B: Serialize + ?Sized,
    {
        let request = match self
            .request_builder()
            .and_then(|builder| builder.build_request(endpoint, body))
        {
            Ok(request) => request,
            Err(err) => return Box::pin(stream::once(async move { Err(err) })),
        };

        self.executor().execute_streaming(request)
    }

    pub fn stream_post<B>(
        &self,
        path: &str,
        body: &B,
    ) -> BoxStream<'static, Result<Value, ErrorKind>>
    where
        B: Serialize + ?Sized,
    {
        self.stream(&Endpoint::streaming_post(path), Some(body))
    }

    pub async fn generate_content<B>(&self, model: &str, request: &B) -> Result<Value, ErrorKind>
    where
        B: Serialize + ?Sized,
    {
        self.post(&model_path(model, Some("generateContent")), request).await
    }

    /// Streams `streamGenerateContent` responses as server-sent events.
    pub fn stream_generate_content<B>(
        &self,
        model: &str,
        request: &B,
    ) -> BoxStream<'static, Result<Value, ErrorKind>>
    where
        B: Serialize + ?Sized,
    {
        let endpoint = Endpoint::streaming_post(model_path(model, Some("streamGenerateContent")))
            .with_query_param("alt", "sse");
        self.stream(&endpoint, Some(request))
    }

    pub async fn count_tokens<B>(&self, model: &str, request: &B) -> Result<Value, ErrorKind>
    where
        B: Serialize + ?Sized,
    {
        self.post(&model_path(model, Some("countTokens")), request).await
    }

    pub async fn list_models(&self) -> Result<Value, ErrorKind> {
        self.get("models").await
    }

    pub async fn get_model(&self, model: &str) -> Result<Value, ErrorKind> {
        self.get(&model_path(model, None)).await
    }
}

/// `models/{model}[:{method}]`, accepting names with or without the `models/` prefix.
fn model_path(model: &str, method: Option<&str>) -> String {
    let model = model.strip_prefix("models/").unwrap_or(model);
    match method {
        Some(method) => format!("models/{model}:{method}"),
        None => format!("models/{model}"),
    }
}

impl fmt::Debug for Gemini {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gemini")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field(
                "oauth_token",
                &self.oauth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .field("timeout", &self.timeout)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

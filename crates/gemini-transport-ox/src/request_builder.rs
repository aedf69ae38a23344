use std::{collections::HashMap, fmt};

use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method,
    header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, USER_AGENT},
};
use serde::Serialize;
use url::Url;

use crate::error::ErrorKind;

/// Header the Gemini API reads the API key from.
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// HTTP method for API endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Patch => Method::PATCH,
        }
    }
}

/// How credentials are attached to every request.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// API key in a header (Gemini uses `x-goog-api-key`).
    ApiKey { header_name: String, key: String },
    /// `Authorization: Bearer <token>`, used with OAuth access tokens.
    Bearer(String),
    /// Credential passed as a query parameter, e.g. `?key=<key>`.
    QueryParam(String, String),
}

impl AuthMethod {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey {
            header_name: API_KEY_HEADER.to_string(),
            key: key.into(),
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey { header_name, .. } => f
                .debug_struct("ApiKey")
                .field("header_name", header_name)
                .field("key", &"[REDACTED]")
                .finish(),
            Self::Bearer(_) => f.debug_tuple("Bearer").field(&"[REDACTED]").finish(),
            Self::QueryParam(name, _) => f
                .debug_tuple("QueryParam")
                .field(name)
                .field(&"[REDACTED]")
                .finish(),
        }
    }
}

/// Represents an API endpoint with its configuration
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub path: String,
    pub method: HttpMethod,
    pub extra_headers: Option<HashMap<String, String>>,
    pub query_params: Option<Vec<(String, String)>>,
    pub streaming: bool,
}

impl Endpoint {
    pub fn new(path: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            path: path.into(),
            method,
            extra_headers: None,
            query_params: None,
            streaming: false,
        }
    }

    /// A POST endpoint whose response is consumed as an event stream.
    pub fn streaming_post(path: impl Into<String>) -> Self {
        Self {
            streaming: true,
            ..Self::new(path, HttpMethod::Post)
        }
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut headers = self.extra_headers.unwrap_or_default();
        headers.insert(key.into(), value.into());
        self.extra_headers = Some(headers);
        self
    }

    #[must_use]
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_query_params(mut self, params: Vec<(String, String)>) -> Self {
        self.query_params = Some(params);
        self
    }
}

/// Configuration for request building
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub base_url: String,
    pub api_version: Option<String>,
    pub auth: Option<AuthMethod>,
    pub default_headers: HashMap<String, String>,
    pub user_agent: Option<String>,
}

impl RequestConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_version: None,
            auth: None,
            default_headers: HashMap::new(),
            user_agent: None,
        }
    }

    #[must_use]
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_auth(mut self, auth: AuthMethod) -> Self {
        self.auth = Some(auth);
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// A fully-built request, ready to be sent any number of times.
#[derive(Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl fmt::Debug for PreparedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Header values may carry credentials.
        let header_names: Vec<&str> = self.headers.keys().map(HeaderName::as_str).collect();
        let mut url = self.url.clone();
        url.set_query(None);

        f.debug_struct("PreparedRequest")
            .field("method", &self.method)
            .field("url", &url.as_str())
            .field("headers", &header_names)
            .field("body_len", &self.body.as_ref().map(Bytes::len))
            .finish()
    }
}

/// Turns endpoints into [`PreparedRequest`]s under one [`RequestConfig`].
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    config: RequestConfig,
}

impl RequestBuilder {
    pub fn new(config: RequestConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// Builds the request for `endpoint`, serializing `body` as JSON.
    ///
    /// Failures here are the caller's fault and classify as
    /// [`ErrorKind::Validation`].
    pub fn build_request<B>(
        &self,
        endpoint: &Endpoint,
        body: Option<&B>,
    ) -> Result<PreparedRequest, ErrorKind>
    where
        B: Serialize + ?Sized,
    {
        let url = self.url_for(endpoint)?;
        let headers = self.headers_for(endpoint, body.is_some())?;
        let body = body
            .map(|b| serde_json::to_vec(b).map(Bytes::from))
            .transpose()
            .map_err(|e| ErrorKind::validation(format!("failed to serialize request body: {e}")))?;

        Ok(PreparedRequest {
            method: endpoint.method.into(),
            url,
            headers,
            body,
        })
    }

    fn url_for(&self, endpoint: &Endpoint) -> Result<Url, ErrorKind> {
        let mut raw = self.config.base_url.trim_end_matches('/').to_string();
        if let Some(version) = &self.config.api_version {
            raw.push('/');
            raw.push_str(version.trim_matches('/'));
        }
        raw.push('/');
        raw.push_str(endpoint.path.trim_start_matches('/'));

        let mut url = Url::parse(&raw)
            .map_err(|e| ErrorKind::validation(format!("invalid URL {raw:?}: {e}")))?;

        let auth_param = match &self.config.auth {
            Some(AuthMethod::QueryParam(name, value)) => Some((name, value)),
            _ => None,
        };

        if endpoint.query_params.is_some() || auth_param.is_some() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in endpoint.query_params.iter().flatten() {
                pairs.append_pair(key, value);
            }
            if let Some((name, value)) = auth_param {
                pairs.append_pair(name, value);
            }
        }

        Ok(url)
    }

    fn headers_for(&self, endpoint: &Endpoint, has_body: bool) -> Result<HeaderMap, ErrorKind> {
        let mut headers = HeaderMap::new();

        if endpoint.streaming {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        } else {
            headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }

        match &self.config.auth {
            Some(AuthMethod::ApiKey { header_name, key }) => {
                insert_header(&mut headers, header_name, key)?;
            }
            Some(AuthMethod::Bearer(token)) => {
                let mut value = header_value(&format!("Bearer {token}"))?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
            Some(AuthMethod::QueryParam(..)) | None => {}
        }

        for (key, value) in &self.config.default_headers {
            insert_header(&mut headers, key, value)?;
        }

        if let Some(user_agent) = &self.config.user_agent {
            headers.insert(USER_AGENT, header_value(user_agent)?);
        }

        if has_body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        // Endpoint headers win over everything configured above.
        for (key, value) in endpoint.extra_headers.iter().flatten() {
            insert_header(&mut headers, key, value)?;
        }

        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ErrorKind> {
    HeaderValue::from_str(value)
        .map_err(|e| ErrorKind::validation(format!("invalid header value: {e}")))
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), ErrorKind> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ErrorKind::validation(format!("invalid header name {name:?}: {e}")))?;
    headers.insert(name, header_value(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn builder() -> RequestBuilder {
        RequestBuilder::new(
            RequestConfig::new("https://generativelanguage.googleapis.com/")
                .with_api_version("v1beta")
                .with_auth(AuthMethod::api_key("secret")),
        )
    }

    #[test]
    fn url_joins_base_version_and_path() {
        let endpoint = Endpoint::new("/models/gemini-2.0-flash:generateContent", HttpMethod::Post);
        let request = builder().build_request(&endpoint, Some(&json!({}))).unwrap();
        assert_eq!(
            request.url.as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert_eq!(request.method, Method::POST);
    }

    #[test]
    fn base_headers_include_api_key_and_accept() {
        let endpoint = Endpoint::new("models", HttpMethod::Get);
        let request = builder().build_request::<()>(&endpoint, None).unwrap();
        assert_eq!(request.headers[API_KEY_HEADER], "secret");
        assert_eq!(request.headers[ACCEPT], "application/json");
        assert!(request.headers.get(CONTENT_TYPE).is_none());
        assert!(request.body.is_none());
    }

    #[test]
    fn streaming_requests_ask_for_event_stream_without_cache() {
        let endpoint = Endpoint::streaming_post("models/x:streamGenerateContent")
            .with_query_param("alt", "sse");
        let request = builder().build_request(&endpoint, Some(&json!({"a": 1}))).unwrap();
        assert_eq!(request.headers[ACCEPT], "text/event-stream");
        assert_eq!(request.headers[CACHE_CONTROL], "no-cache");
        assert_eq!(request.headers[CONTENT_TYPE], "application/json");
        assert_eq!(request.url.query(), Some("alt=sse"));
        assert_eq!(request.body.as_deref(), Some(&b"{\"a\":1}"[..]));
    }

    #[test]
    fn extra_headers_override_base_headers() {
        let endpoint = Endpoint::new("models", HttpMethod::Get).with_header("accept", "text/plain");
        let request = builder().build_request::<()>(&endpoint, None).unwrap();
        assert_eq!(request.headers[ACCEPT], "text/plain");
    }

    #[test]
    fn bearer_and_query_auth() {
        let bearer = RequestBuilder::new(
            RequestConfig::new("https://example.com").with_auth(AuthMethod::Bearer("tok".into())),
        );
        let request = bearer
            .build_request::<()>(&Endpoint::new("x", HttpMethod::Get), None)
            .unwrap();
        assert_eq!(request.headers[AUTHORIZATION], "Bearer tok");

        let query = RequestBuilder::new(
            RequestConfig::new("https://example.com")
                .with_auth(AuthMethod::QueryParam("key".into(), "k1".into())),
        );
        let endpoint = Endpoint::new("x", HttpMethod::Get).with_query_param("pageSize", "5");
        let request = query.build_request::<()>(&endpoint, None).unwrap();
        assert_eq!(request.url.query(), Some("pageSize=5&key=k1"));
    }

    #[test]
    fn bad_header_is_a_validation_error() {
        let endpoint = Endpoint::new("x", HttpMethod::Get).with_header("bad header", "v");
        let err = builder().build_request::<()>(&endpoint, None).unwrap_err();
        assert!(matches!(err, ErrorKind::Validation { .. }));
    }

    #[test]
    fn debug_output_hides_credentials() {
        let query = RequestBuilder::new(
            RequestConfig::new("https://example.com")
                .with_auth(AuthMethod::QueryParam("key".into(), "topsecret".into())),
        );
        let request = query
            .build_request::<()>(&Endpoint::new("x", HttpMethod::Get), None)
            .unwrap();
        let rendered = format!("{request:?} {:?}", AuthMethod::api_key("topsecret"));
        assert!(!rendered.contains("topsecret"));
    }

    #[test]
    fn method_display_is_uppercase() {
        assert_eq!(HttpMethod::Patch.to_string(), "PATCH");
    }
}

use std::{collections::BTreeMap, sync::LazyLock, time::Duration};

use regex::Regex;
use serde::{Deserialize, Serialize, Serializer, ser::SerializeStruct};
use serde_json::Value;
use thiserror::Error;

use crate::transport::TransportFailure;

/// Wait applied to a 429 response whose body carries no usable `retry_after`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Matches `retry_after: 12`, `"retry_after": "1.5"` and similar loose spellings.
static RETRY_AFTER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)retry_after["']?\s*[:=]\s*["']?(\d+(?:\.\d+)?)"#)
        .expect("retry_after pattern must compile")
});

/// Every failure a caller can observe from the transport.
///
/// Raw transport failures and HTTP error statuses are normalized into exactly
/// one of these variants before they reach the retry loop or the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, strum::EnumDiscriminants)]
#[strum_discriminants(name(ErrorCategory))]
#[strum_discriminants(derive(Hash, PartialOrd, Ord, strum::Display, strum::EnumString))]
pub enum ErrorKind {
    /// Missing or rejected credentials.
    #[error("authentication failed: {message}")]
    Auth {
        status_code: Option<u16>,
        message: String,
    },

    /// The API asked us to slow down.
    #[error("rate limit exceeded (retry after {retry_after:?}): {message}")]
    RateLimit {
        retry_after: Duration,
        message: String,
    },

    /// The request or the response body was not acceptable.
    #[error("invalid request: {message}")]
    Validation {
        field_errors: BTreeMap<String, String>,
        message: String,
    },

    /// Connection-level failure, or a status code outside the other buckets.
    #[error("network error{}: {message}", .status_code.map(|c| format!(" (HTTP {c})")).unwrap_or_default())]
    Network {
        status_code: Option<u16>,
        message: String,
    },

    /// A single attempt exceeded its deadline.
    #[error("request timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The API failed on its side.
    #[error("server error (HTTP {status_code}): {message}")]
    Server { status_code: u16, message: String },

    /// The account ran out of quota.
    #[error("quota exceeded: {message}")]
    Quota { message: String },
}

impl ErrorKind {
    /// Builds a `Validation` error without field-level detail.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            field_errors: BTreeMap::new(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.into()
    }

    /// HTTP status code attached to this error, if any.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Auth { status_code, .. } | Self::Network { status_code, .. } => *status_code,
            Self::Server { status_code, .. } => Some(*status_code),
            Self::RateLimit { .. } => Some(429),
            Self::Validation { .. } | Self::Timeout { .. } | Self::Quota { .. } => None,
        }
    }

    /// Whether this kind describes a condition that may clear up on its own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. }
                | Self::Network { .. }
                | Self::Timeout { .. }
                | Self::Server { .. }
        )
    }
}

impl Serialize for ErrorKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            ErrorKind::Auth {
                status_code,
                message,
            } => {
                let mut state = serializer.serialize_struct("ErrorKind", 3)?;
                state.serialize_field("type", "Auth")?;
                state.serialize_field("status_code", status_code)?;
                state.serialize_field("message", message)?;
                state.end()
            }
            ErrorKind::RateLimit {
                retry_after,
                message,
            } => {
                let mut state = serializer.serialize_struct("ErrorKind", 3)?;
                state.serialize_field("type", "RateLimit")?;
                state.serialize_field("retry_after_secs", &retry_after.as_secs_f64())?;
                state.serialize_field("message", message)?;
                state.end()
            }
            ErrorKind::Validation {
                field_errors,
                message,
            } => {
                let mut state = serializer.serialize_struct("ErrorKind", 3)?;
                state.serialize_field("type", "Validation")?;
                state.serialize_field("field_errors", field_errors)?;
                state.serialize_field("message", message)?;
                state.end()
            }
            ErrorKind::Network {
                status_code,
                message,
            } => {
                let mut state = serializer.serialize_struct("ErrorKind", 3)?;
                state.serialize_field("type", "Network")?;
                state.serialize_field("status_code", status_code)?;
                state.serialize_field("message", message)?;
                state.end()
            }
            ErrorKind::Timeout { duration } => {
                let mut state = serializer.serialize_struct("ErrorKind", 2)?;
                state.serialize_field("type", "Timeout")?;
                state.serialize_field("duration_secs", &duration.as_secs_f64())?;
                state.end()
            }
            ErrorKind::Server {
                status_code,
                message,
            } => {
                let mut state = serializer.serialize_struct("ErrorKind", 3)?;
                state.serialize_field("type", "Server")?;
                state.serialize_field("status_code", status_code)?;
                state.serialize_field("message", message)?;
                state.end()
            }
            ErrorKind::Quota { message } => {
                let mut state = serializer.serialize_struct("ErrorKind", 2)?;
                state.serialize_field("type", "Quota")?;
                state.serialize_field("message", message)?;
                state.end()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct GoogleApiErrorPayload {
    error: GoogleApiErrorDetails,
}

#[derive(Debug, Deserialize)]
struct GoogleApiErrorDetails {
    message: String,
}

/// Maps an HTTP error status into the taxonomy.
///
/// `message` is used when the body carries no Google error envelope. `body` is
/// also scanned for a `retry_after` hint on 429 responses.
#[must_use]
pub fn classify_status_code(code: u16, message: &str, body: Option<&str>) -> ErrorKind {
    let message = describe(message, body);

    match code {
        400 => ErrorKind::validation(message),
        401 | 403 => ErrorKind::Auth {
            status_code: Some(code),
            message,
        },
        404 => ErrorKind::Network {
            status_code: Some(404),
            message,
        },
        429 => ErrorKind::RateLimit {
            retry_after: body
                .and_then(extract_retry_after)
                .unwrap_or(DEFAULT_RETRY_AFTER),
            message,
        },
        500..=504 => ErrorKind::Server {
            status_code: code,
            message,
        },
        402..=499 => ErrorKind::validation(message),
        505..=599 => ErrorKind::Server {
            status_code: code,
            message,
        },
        _ => ErrorKind::Network {
            status_code: Some(code),
            message,
        },
    }
}

/// Maps a failure raised below HTTP (connect, deadline, body decode) into the
/// taxonomy. `timeout` is the per-attempt deadline that was in force.
#[must_use]
pub fn classify_transport_failure(failure: &TransportFailure, timeout: Duration) -> ErrorKind {
    match failure {
        TransportFailure::Connect(message) | TransportFailure::Other(message) => {
            ErrorKind::Network {
                status_code: None,
                message: message.clone(),
            }
        }
        TransportFailure::Timeout => ErrorKind::Timeout { duration: timeout },
        TransportFailure::Decode(message) => ErrorKind::validation(message.clone()),
    }
}

/// Best-effort search for a numeric `retry_after` anywhere in the body text.
#[must_use]
pub fn extract_retry_after(body: &str) -> Option<Duration> {
    let captures = RETRY_AFTER_PATTERN.captures(body)?;
    let seconds = captures.get(1)?.as_str().parse::<f64>().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

fn describe(fallback: &str, body: Option<&str>) -> String {
    let Some(body) = body.map(str::trim).filter(|b| !b.is_empty()) else {
        return fallback.to_string();
    };

    if let Ok(payload) = serde_json::from_str::<GoogleApiErrorPayload>(body) {
        return payload.error.message;
    }

    // Some proxies answer with a flat `{"message": "..."}`.
    if let Some(message) = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
    {
        return message;
    }

    format!("{fallback}: {body}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_request_is_validation_with_no_field_errors() {
        let err = classify_status_code(400, "Bad Request", None);
        match err {
            ErrorKind::Validation {
                field_errors,
                message,
            } => {
                assert!(field_errors.is_empty());
                assert_eq!(message, "Bad Request");
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn auth_statuses() {
        for code in [401, 403] {
            let err = classify_status_code(code, "nope", None);
            assert_eq!(err.category(), ErrorCategory::Auth);
            assert_eq!(err.status_code(), Some(code));
        }
    }

    #[test]
    fn not_found_is_network_with_status() {
        let err = classify_status_code(404, "Not Found", None);
        assert!(matches!(
            err,
            ErrorKind::Network {
                status_code: Some(404),
                ..
            }
        ));
    }

    #[test]
    fn rate_limit_reads_retry_after_from_body() {
        let body = r#"{"error": {"code": 429, "message": "slow down", "retry_after": 7}}"#;
        let err = classify_status_code(429, "Too Many Requests", Some(body));
        assert_eq!(
            err,
            ErrorKind::RateLimit {
                retry_after: Duration::from_secs(7),
                message: "slow down".to_string(),
            }
        );
    }

    #[test]
    fn rate_limit_defaults_to_sixty_seconds() {
        let err = classify_status_code(429, "Too Many Requests", Some("try later"));
        assert!(matches!(
            err,
            ErrorKind::RateLimit { retry_after, .. } if retry_after == DEFAULT_RETRY_AFTER
        ));

        let err = classify_status_code(429, "Too Many Requests", None);
        assert!(matches!(
            err,
            ErrorKind::RateLimit { retry_after, .. } if retry_after == DEFAULT_RETRY_AFTER
        ));
    }

    #[test]
    fn retry_after_pattern_is_lenient() {
        assert_eq!(
            extract_retry_after(r#"{"retry_after":"1.5"}"#),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            extract_retry_after("retry_after = 3 seconds"),
            Some(Duration::from_secs(3))
        );
        assert_eq!(
            extract_retry_after(r#"{"details": [{"RETRY_AFTER": 2}]}"#),
            Some(Duration::from_secs(2))
        );
        assert_eq!(extract_retry_after(r#"{"retry_after": "soon"}"#), None);
        assert_eq!(extract_retry_after(""), None);
    }

    #[test]
    fn server_range_and_other_statuses() {
        for code in 500..=504 {
            assert_eq!(
                classify_status_code(code, "boom", None),
                ErrorKind::Server {
                    status_code: code,
                    message: "boom".to_string()
                }
            );
        }
        assert_eq!(classify_status_code(599, "x", None).category(), ErrorCategory::Server);
        assert_eq!(classify_status_code(418, "x", None).category(), ErrorCategory::Validation);
        assert_eq!(classify_status_code(422, "x", None).category(), ErrorCategory::Validation);
        assert_eq!(
            classify_status_code(302, "Found", None),
            ErrorKind::Network {
                status_code: Some(302),
                message: "Found".to_string()
            }
        );
    }

    #[test]
    fn every_status_code_maps_to_one_kind() {
        for code in 100..=599u16 {
            let err = classify_status_code(code, "status", Some("{}"));
            let expected = match code {
                401 | 403 => ErrorCategory::Auth,
                404 => ErrorCategory::Network,
                429 => ErrorCategory::RateLimit,
                400..=499 => ErrorCategory::Validation,
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Network,
            };
            assert_eq!(err.category(), expected, "status {code}");
        }
    }

    #[test]
    fn message_prefers_google_error_envelope() {
        let body = r#"{"error": {"code": 400, "message": "API key not valid.", "status": "INVALID_ARGUMENT"}}"#;
        let err = classify_status_code(400, "Bad Request", Some(body));
        assert_eq!(err, ErrorKind::validation("API key not valid."));

        let err = classify_status_code(502, "Bad Gateway", Some("<html>upstream</html>"));
        assert_eq!(
            err,
            ErrorKind::Server {
                status_code: 502,
                message: "Bad Gateway: <html>upstream</html>".to_string()
            }
        );
    }

    #[test]
    fn transport_failures() {
        let timeout = Duration::from_secs(30);
        assert_eq!(
            classify_transport_failure(&TransportFailure::Connect("refused".into()), timeout),
            ErrorKind::Network {
                status_code: None,
                message: "refused".to_string()
            }
        );
        assert_eq!(
            classify_transport_failure(&TransportFailure::Timeout, timeout),
            ErrorKind::Timeout { duration: timeout }
        );
        assert_eq!(
            classify_transport_failure(&TransportFailure::Decode("eof".into()), timeout).category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            classify_transport_failure(&TransportFailure::Other("???".into()), timeout).category(),
            ErrorCategory::Network
        );
    }

    #[test]
    fn category_names_round_trip_through_strum() {
        assert_eq!(ErrorCategory::RateLimit.to_string(), "RateLimit");
        assert_eq!("Timeout".parse::<ErrorCategory>().ok(), Some(ErrorCategory::Timeout));
    }

    #[test]
    fn serialize_carries_type_tag() {
        let err = ErrorKind::RateLimit {
            retry_after: Duration::from_secs(2),
            message: "slow".to_string(),
        };
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], "RateLimit");
        assert_eq!(value["retry_after_secs"], 2.0);
        assert_eq!(value["message"], "slow");
    }

    #[test]
    fn display_includes_status_when_present() {
        let err = ErrorKind::Network {
            status_code: Some(404),
            message: "missing".to_string(),
        };
        assert_eq!(err.to_string(), "network error (HTTP 404): missing");

        let err = ErrorKind::Network {
            status_code: None,
            message: "refused".to_string(),
        };
        assert_eq!(err.to_string(), "network error: refused");
    }
}

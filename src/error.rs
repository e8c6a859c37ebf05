use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Categories of API errors for consistent handling across the client.
///
/// Only `Unauthorized` is ever intercepted by the renewal flow; every other
/// kind passes through to the caller untouched so forms can render the
/// backend's messages verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    /// Authentication missing, expired, or rejected (HTTP 401)
    Unauthorized,
    /// Caller lacks access to the resource or org (HTTP 403) — never retried
    Forbidden,
    /// Field or form validation failure (HTTP 400/422), body preserved
    Validation,
    /// Any other non-success HTTP status
    HttpStatus,
    /// Connection or request timeout
    Timeout,
    /// Failed to parse a response body
    Parse,
    /// Token renewal itself failed — the session is unrecoverable
    SessionExpired,
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiErrorKind::Unauthorized => write!(f, "unauthorized"),
            ApiErrorKind::Forbidden => write!(f, "forbidden"),
            ApiErrorKind::Validation => write!(f, "validation"),
            ApiErrorKind::HttpStatus => write!(f, "http_status"),
            ApiErrorKind::Timeout => write!(f, "timeout"),
            ApiErrorKind::Parse => write!(f, "parse"),
            ApiErrorKind::SessionExpired => write!(f, "session_expired"),
        }
    }
}

/// Structured error from the API client with kind and details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Error category
    pub kind: ApiErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional raw response body (validation errors keep it verbatim)
    pub details: Option<String>,
    /// HTTP status, when the error came from a response
    pub status: Option<u16>,
}

impl ApiError {
    /// Creates a new error with no details.
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            status: None,
        }
    }

    /// Classifies a non-success HTTP response into an error.
    ///
    /// 401 → `Unauthorized`, 403 → `Forbidden`, 400/422 → `Validation`,
    /// everything else → `HttpStatus`. The body is kept in `details` and a
    /// `detail`/`error.message` field is lifted into the summary when present.
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 => ApiErrorKind::Unauthorized,
            403 => ApiErrorKind::Forbidden,
            400 | 422 => ApiErrorKind::Validation,
            _ => ApiErrorKind::HttpStatus,
        };

        let summary = extract_detail(body)
            .map_or_else(|| format!("HTTP {status}"), |msg| format!("HTTP {status}: {msg}"));

        Self {
            kind,
            message: summary,
            details: (!body.is_empty()).then(|| body.to_string()),
            status: Some(status),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Timeout, message)
    }

    /// Creates a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Parse, message)
    }

    /// Creates the unrecoverable-session error produced when renewal fails.
    /// Carries the renewal failure, not the original 401.
    pub fn session_expired(cause: impl Into<String>) -> Self {
        Self::new(
            ApiErrorKind::SessionExpired,
            format!("session expired: {}", cause.into()),
        )
    }

    /// Classifies a transport-level reqwest error.
    pub fn from_transport(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(format!("request timed out: {e}"))
        } else if e.is_connect() {
            Self::timeout(format!("connection failed: {e}"))
        } else if e.is_decode() {
            Self::parse(format!("failed to decode response: {e}"))
        } else {
            Self::new(ApiErrorKind::HttpStatus, format!("network error: {e}"))
        }
    }
}

/// Pulls a human-readable message out of a DRF-style error body.
/// Looks for `detail` (string) or `error.message`.
fn extract_detail(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    if let Some(detail) = json.get("detail").and_then(Value::as_str) {
        return Some(detail.to_string());
    }
    json.get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ApiError {}

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Categories of transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// Connection refused, DNS failure, TLS failure
    Connect,
    /// Connect or request timeout
    Timeout,
    /// Non-success HTTP status
    HttpStatus,
    /// Reading the response body failed mid-stream
    Body,
    /// Response carried no body to stream
    MissingBody,
    /// Response body was not the expected shape
    Parse,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Connect => write!(f, "connect"),
            TransportErrorKind::Timeout => write!(f, "timeout"),
            TransportErrorKind::HttpStatus => write!(f, "http_status"),
            TransportErrorKind::Body => write!(f, "body"),
            TransportErrorKind::MissingBody => write!(f, "missing_body"),
            TransportErrorKind::Parse => write!(f, "parse"),
        }
    }
}

/// Structured error from the inference service transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportError {
    /// Error category
    pub kind: TransportErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// Optional additional details (e.g., raw error body)
    pub details: Option<String>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Creates an HTTP status error, pulling `detail` out of a JSON body when
    /// the service sent one.
    pub fn http_status(status: u16, body: &str) -> Self {
        if let Ok(json) = serde_json::from_str::<Value>(body)
            && let Some(detail) = json.get("detail").and_then(Value::as_str)
        {
            return Self {
                kind: TransportErrorKind::HttpStatus,
                message: format!("HTTP {status}: {detail}"),
                details: Some(body.to_string()),
            };
        }

        Self {
            kind: TransportErrorKind::HttpStatus,
            message: format!("HTTP {status}"),
            details: (!body.is_empty()).then(|| body.to_string()),
        }
    }

    pub fn missing_body() -> Self {
        Self::new(TransportErrorKind::MissingBody, "No response body")
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(TransportErrorKind::Timeout, format!("Request timed out: {e}"))
        } else if e.is_connect() {
            Self::new(TransportErrorKind::Connect, format!("Connection failed: {e}"))
        } else if e.is_body() || e.is_decode() {
            Self::new(TransportErrorKind::Body, format!("Response body error: {e}"))
        } else {
            Self::new(TransportErrorKind::Connect, format!("Network error: {e}"))
        }
    }
}

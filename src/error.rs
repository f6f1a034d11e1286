//! Error types for the attestation service

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Permanent error: {0}")]
    Permanent(String),

    #[error("Networking error: {message}")]
    NetworkingRetry { message: String, retry: bool },

    #[error("Attestation rejected: {message} (arc: {arc}, reasons: {reasons})")]
    Rejection {
        message: String,
        arc: String,
        reasons: String,
    },

    #[error("No matching public key pin for {host}")]
    PinValidation { host: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("API error: HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid header value: {0}")]
    HeaderValue(#[from] reqwest::header::InvalidHeaderValue),
}

impl Error {
    pub(crate) fn retry(message: impl Into<String>) -> Self {
        Error::NetworkingRetry {
            message: message.into(),
            retry: true,
        }
    }

    pub(crate) fn rejection(
        message: impl Into<String>,
        arc: Option<&str>,
        reasons: Option<&str>,
    ) -> Self {
        Error::Rejection {
            message: message.into(),
            arc: arc.unwrap_or_default().to_string(),
            reasons: reasons.unwrap_or_default().to_string(),
        }
    }

    /// Whether re-issuing the whole request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NetworkingRetry { retry: true, .. })
    }

    /// The attestation rejection code, if this is a rejection
    pub fn rejection_arc(&self) -> Option<&str> {
        match self {
            Error::Rejection { arc, .. } => Some(arc),
            _ => None,
        }
    }
}

/// Failure of the attestation capability call itself, as opposed to a
/// status it returned
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("attestation bridge call failed: {0}")]
pub struct BridgeError(pub String);

pub type Result<T> = std::result::Result<T, Error>;

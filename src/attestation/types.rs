//! Core types for attestation fetch results

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a token, secure string or custom JWT fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchStatus {
    Success,
    NoNetwork,
    PoorNetwork,
    MitmDetected,
    UnknownUrl,
    UnprotectedUrl,
    NoApproovService,
    Rejected,
    Disabled,
    UnknownKey,
    BadKey,
    BadPayload,
    NotInitialized,
    InternalError,
}

/// How callers should react to a [`FetchStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyClass {
    /// A token is present, or the destination is intentionally unprotected
    SuccessLike,
    /// Network conditions prevented the fetch; the request may be re-issued
    Retryable,
    /// Attestation explicitly refused; carries an ARC and reasons
    Rejection,
    /// Unexpected or unsupported outcome
    Permanent,
}

impl FetchStatus {
    pub const ALL: [FetchStatus; 14] = [
        FetchStatus::Success,
        FetchStatus::NoNetwork,
        FetchStatus::PoorNetwork,
        FetchStatus::MitmDetected,
        FetchStatus::UnknownUrl,
        FetchStatus::UnprotectedUrl,
        FetchStatus::NoApproovService,
        FetchStatus::Rejected,
        FetchStatus::Disabled,
        FetchStatus::UnknownKey,
        FetchStatus::BadKey,
        FetchStatus::BadPayload,
        FetchStatus::NotInitialized,
        FetchStatus::InternalError,
    ];

    /// Classify this status. `UnknownKey` lands in `Permanent` here; the
    /// substitution passes treat it as a silent skip on their own.
    pub fn policy_class(self) -> PolicyClass {
        match self {
            FetchStatus::Success
            | FetchStatus::UnprotectedUrl
            | FetchStatus::UnknownUrl
            | FetchStatus::NoApproovService => PolicyClass::SuccessLike,
            FetchStatus::NoNetwork | FetchStatus::PoorNetwork | FetchStatus::MitmDetected => {
                PolicyClass::Retryable
            }
            FetchStatus::Rejected => PolicyClass::Rejection,
            FetchStatus::Disabled
            | FetchStatus::UnknownKey
            | FetchStatus::BadKey
            | FetchStatus::BadPayload
            | FetchStatus::NotInitialized
            | FetchStatus::InternalError => PolicyClass::Permanent,
        }
    }

    pub fn is_retryable(self) -> bool {
        self.policy_class() == PolicyClass::Retryable
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FetchStatus::Success => "SUCCESS",
            FetchStatus::NoNetwork => "NO_NETWORK",
            FetchStatus::PoorNetwork => "POOR_NETWORK",
            FetchStatus::MitmDetected => "MITM_DETECTED",
            FetchStatus::UnknownUrl => "UNKNOWN_URL",
            FetchStatus::UnprotectedUrl => "UNPROTECTED_URL",
            FetchStatus::NoApproovService => "NO_APPROOV_SERVICE",
            FetchStatus::Rejected => "REJECTED",
            FetchStatus::Disabled => "DISABLED",
            FetchStatus::UnknownKey => "UNKNOWN_KEY",
            FetchStatus::BadKey => "BAD_KEY",
            FetchStatus::BadPayload => "BAD_PAYLOAD",
            FetchStatus::NotInitialized => "NOT_INITIALIZED",
            FetchStatus::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single query to the attestation capability
///
/// Produced once per query and never cached beyond the current request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResult {
    pub status: FetchStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure_string: Option<String>,

    /// Attestation rejection code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arc: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reasons: Option<String>,

    /// Redacted form of the token that is safe to log
    #[serde(default)]
    pub loggable_token: String,
}

impl FetchResult {
    /// A result carrying only a status
    pub fn with_status(status: FetchStatus) -> Self {
        Self {
            status,
            token: None,
            secure_string: None,
            arc: None,
            rejection_reasons: None,
            loggable_token: String::new(),
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        let token = token.into();
        let mut result = Self::with_status(FetchStatus::Success);
        result.loggable_token = loggable(&token);
        result.token = Some(token);
        result
    }

    pub fn secure_string(value: impl Into<String>) -> Self {
        let mut result = Self::with_status(FetchStatus::Success);
        result.secure_string = Some(value.into());
        result
    }

    pub fn rejected(arc: impl Into<String>, reasons: impl Into<String>) -> Self {
        let mut result = Self::with_status(FetchStatus::Rejected);
        result.arc = Some(arc.into());
        result.rejection_reasons = Some(reasons.into());
        result
    }

    pub fn policy_class(&self) -> PolicyClass {
        self.status.policy_class()
    }
}

/// Keep only the JWT header so the token can be logged without exposing claims
fn loggable(token: &str) -> String {
    match token.split_once('.') {
        Some((header, _)) => format!("{}.…", header),
        None if token.chars().count() > 8 => {
            format!("{}…", token.chars().take(8).collect::<String>())
        }
        None => token.to_string(),
    }
}

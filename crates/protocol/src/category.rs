use std::fmt;

use serde::{Deserialize, Serialize};

/// User-facing failure taxonomy.
///
/// Backend-specific errors are folded into one of these before anything is
/// sent to a client; the raw detail only ever reaches the server log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    QuotaExceeded,
    Forbidden,
    RateLimited,
    UpstreamInternal,
    Unreachable,
    Timeout,
    PersistenceFailure,
    NotFound,
    #[default]
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 10] = [
        Self::Authentication,
        Self::QuotaExceeded,
        Self::Forbidden,
        Self::RateLimited,
        Self::UpstreamInternal,
        Self::Unreachable,
        Self::Timeout,
        Self::PersistenceFailure,
        Self::NotFound,
        Self::Unknown,
    ];

    /// Sanitized text shown to the end user.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::Authentication => "The AI service rejected our credentials (authentication failed).",
            Self::QuotaExceeded => "The AI service is unavailable; please check the account balance or quota.",
            Self::Forbidden => "Access to the AI service was denied.",
            Self::RateLimited => "Too many requests to the AI service; please retry in a moment.",
            Self::UpstreamInternal => "The AI service reported an internal error.",
            Self::Unreachable => "Cannot reach the AI service; please check the network connection.",
            Self::Timeout => "The AI service timed out.",
            Self::PersistenceFailure => {
                "The answer was generated but could not be saved; it will not appear after a reload."
            }
            Self::NotFound => "The requested chat or message does not exist.",
            Self::Unknown => "Something went wrong while generating the answer; please try again.",
        }
    }

    /// Network-level failures that are worth a bounded retry.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Unreachable | Self::Timeout)
    }

    /// Maps an HTTP status reported by an upstream service.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 => Some(Self::Authentication),
            402 => Some(Self::QuotaExceeded),
            403 => Some(Self::Forbidden),
            404 => Some(Self::NotFound),
            408 | 504 => Some(Self::Timeout),
            429 => Some(Self::RateLimited),
            500..=599 => Some(Self::UpstreamInternal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Forbidden => "forbidden",
            Self::RateLimited => "rate_limited",
            Self::UpstreamInternal => "upstream_internal",
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::PersistenceFailure => "persistence_failure",
            Self::NotFound => "not_found",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

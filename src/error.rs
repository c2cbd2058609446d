// Error handling module
// Defines the typed failures surfaced to gateway callers

use thiserror::Error;

/// Errors returned by `Gateway::request` and the request executor
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No session in the store; the caller must log in first
    #[error("No token found. Login first.")]
    NotAuthenticated,

    /// No response within the request's time budget
    #[error("Request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// Transport failure (DNS, connect, TLS, broken body)
    #[error("Network error: {0}")]
    Network(String),

    /// Refresh failed, or the retried request was still unauthorized
    #[error("Session expired. Please log in again.")]
    SessionExpired,

    /// Any other non-2xx response
    #[error("Request failed ({status}): {message}")]
    RequestFailed { status: u16, message: String },

    /// 2xx response whose payload could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Session store or other local failure
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Whether the presentation layer should send the user back to login
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            GatewayError::NotAuthenticated | GatewayError::SessionExpired
        )
    }

    /// HTTP status of the failed response, if the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::RequestFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Why a refresh cycle failed.
///
/// Every waiter of a cycle receives the same value, so this type is `Clone`
/// and carries only owned strings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    #[error("no session to refresh")]
    NoSession,

    #[error("session has no refresh token")]
    MissingRefreshToken,

    #[error("refresh rejected: {status} - {message}")]
    Rejected { status: u16, message: String },

    #[error("refresh transport failed: {0}")]
    Transport(String),

    #[error("refresh response malformed: {0}")]
    Malformed(String),

    #[error("session store failed during refresh: {0}")]
    Store(String),

    #[error("refresh cycle ended without a result")]
    Aborted,
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

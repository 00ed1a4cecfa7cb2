//! Pipeline error taxonomy
//!
//! Every failure a caller can see carries a stable kind (used as a metrics
//! label and in gateway error bodies), the upstream status where there was
//! one, and a human-readable message.

use thiserror::Error;

/// Stable classification of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Timeout,
    PermissionDenied,
    AuthExpired,
    SessionExpired,
    RefreshFailed,
    Login,
    Cancelled,
    InvalidRequest,
    Decode,
    ResponseTooLarge,
    Store,
}

impl ErrorKind {
    /// Label for metrics and error bodies.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::RefreshFailed => "refresh_failed",
            ErrorKind::Login => "login_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Decode => "decode_error",
            ErrorKind::ResponseTooLarge => "response_too_large",
            ErrorKind::Store => "store_error",
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Connection refused, DNS failure, reset. Session state untouched.
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("permission denied ({status}): {message}")]
    PermissionDenied { status: u16, message: String },

    /// Still unauthorized after the one permitted retry.
    #[error("not authorized after token renewal ({status}): {message}")]
    AuthExpired { status: u16, message: String },

    /// The session is gone and the store has been cleared. Log in again.
    #[error("session expired: {reason}")]
    SessionExpired { status: Option<u16>, reason: String },

    /// Refresh failed but at least one stored token is still time-valid, so
    /// the session was kept.
    #[error("token refresh failed ({status}): {reason}")]
    RefreshFailed { status: u16, reason: String },

    #[error("login failed: {0}")]
    Login(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response body: {0}")]
    Decode(String),

    /// Upstream body exceeded the configured cap; nothing was returned.
    #[error("upstream response ({status}) larger than {limit} bytes")]
    ResponseTooLarge { status: u16, limit: usize },

    #[error("session store error: {0}")]
    Store(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(_) => ErrorKind::Network,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::AuthExpired { .. } => ErrorKind::AuthExpired,
            Error::SessionExpired { .. } => ErrorKind::SessionExpired,
            Error::RefreshFailed { .. } => ErrorKind::RefreshFailed,
            Error::Login(_) => ErrorKind::Login,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::Decode(_) => ErrorKind::Decode,
            Error::ResponseTooLarge { .. } => ErrorKind::ResponseTooLarge,
            Error::Store(_) => ErrorKind::Store,
        }
    }

    /// Upstream HTTP status that produced this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::PermissionDenied { status, .. }
            | Error::AuthExpired { status, .. }
            | Error::RefreshFailed { status, .. }
            | Error::ResponseTooLarge { status, .. } => Some(*status),
            Error::SessionExpired { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether the user has to log in again before retrying.
    pub fn requires_login(&self) -> bool {
        matches!(self, Error::SessionExpired { .. } | Error::AuthExpired { .. })
    }

    pub(crate) fn store(e: session_auth::Error) -> Self {
        Error::Store(e.to_string())
    }
}

/// Result alias using pipeline Error
pub type Result<T> = std::result::Result<T, Error>;

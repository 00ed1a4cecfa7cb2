//! Session policy
//!
//! Pure decision functions, no I/O. The pipeline feeds in what it observed
//! and acts on the returned `Decision`.
//!
//! Session states:
//! - Authenticated → Refreshing (ordinary 401 on a first attempt)
//! - Refreshing → Authenticated (refresh succeeded)
//! - Refreshing → Authenticated (refresh failed, a token is still time-valid)
//! - Refreshing → LoggedOut (refresh failed, both tokens expired)
//! - Authenticated → LoggedOut (401 with `sessionExpired`, or user logout)
//! - LoggedOut → Authenticated (login)

use reqwest::StatusCode;

use crate::guard::UnauthorizedSignal;
use crate::retry::RetryPolicy;

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticated,
    Refreshing,
    LoggedOut,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Authenticated => "authenticated",
            SessionState::Refreshing => "refreshing",
            SessionState::LoggedOut => "logged_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Hand the response to the caller.
    Continue,
    /// Renew the access token and replay the request once.
    RefreshAndRetry,
    /// Clear the session and require a new login.
    HardLogout,
    /// Report the failure; leave the session as it is.
    SurfaceError,
}

/// Local time-validity of the stored pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenValidity {
    pub access: bool,
    pub refresh: bool,
}

impl TokenValidity {
    pub fn any(&self) -> bool {
        self.access || self.refresh
    }
}

/// Decide what an upstream response means for the session.
///
/// An explicit `sessionExpired` overrides everything, including a refresh
/// token that is still valid locally. An ordinary 401 earns one refresh and
/// replay; a second one is surfaced.
pub fn evaluate(status: StatusCode, signal: &UnauthorizedSignal, retry: RetryPolicy) -> Decision {
    match status {
        StatusCode::UNAUTHORIZED if signal.session_expired => Decision::HardLogout,
        StatusCode::UNAUTHORIZED if retry.can_retry() => Decision::RefreshAndRetry,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Decision::SurfaceError,
        _ => Decision::Continue,
    }
}

/// Decide what a failed refresh means for the session.
///
/// While either token is still time-valid the failure is treated as
/// transient and the session survives. Only when both have expired is the
/// session ended.
pub fn after_refresh_failure(validity: TokenValidity) -> Decision {
    if validity.any() {
        Decision::SurfaceError
    } else {
        Decision::HardLogout
    }
}

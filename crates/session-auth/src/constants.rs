//! Compliance API auth constants

/// Login endpoint, relative to the auth base URL
pub const LOGIN_PATH: &str = "/auth/login";

/// Refresh endpoint, relative to the auth base URL
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Canonical key holding the session record in the persisted document
pub const SESSION_KEY: &str = "session";

/// Keys older clients stored the session under, in lookup order.
/// Consulted only when `SESSION_KEY` is absent, then removed.
pub const LEGACY_SESSION_KEYS: &[&str] = &["auth", "userSession", "currentUser"];

/// Access token lifetime assumed when the refresh endpoint omits an expiry.
pub const DEFAULT_ACCESS_TTL_SECS: u64 = 900;

/// Default login type sent when the caller does not specify one.
pub const DEFAULT_LOGIN_TYPE: &str = "password";

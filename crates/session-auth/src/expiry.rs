//! Token expiry timestamps
//!
//! Servers and older clients have written expiries as unix milliseconds, as
//! numeric strings, and as RFC 3339 strings. All of those are accepted. Any
//! other value is kept verbatim so it round-trips through the session file,
//! but it never resolves to an instant, and an unresolvable expiry counts as
//! still valid.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Expiry as persisted: whatever shape the server handed us.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expiry {
    /// Unix timestamp in milliseconds
    Millis(i64),
    /// RFC 3339 or a numeric string of milliseconds
    Text(String),
    /// Anything else (floats, objects, booleans)
    Other(serde_json::Value),
}

impl Expiry {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Expiry::Millis(at.timestamp_millis())
    }

    /// Resolve to an instant, or `None` if the value is malformed.
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Expiry::Millis(ms) => DateTime::from_timestamp_millis(*ms),
            Expiry::Text(s) => {
                let s = s.trim();
                if let Ok(ms) = s.parse::<i64>() {
                    return DateTime::from_timestamp_millis(ms);
                }
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            }
            Expiry::Other(_) => None,
        }
    }
}

/// Whether a token with this expiry may still be used at `now`.
///
/// Absent or malformed expiries are treated as valid: the server remains the
/// authority and will answer 401 if the token is actually dead.
pub fn is_time_valid(expiry: Option<&Expiry>, now: DateTime<Utc>) -> bool {
    match expiry.and_then(Expiry::instant) {
        Some(at) => now < at,
        None => true,
    }
}

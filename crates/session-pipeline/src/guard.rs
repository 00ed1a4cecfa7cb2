//! Response guard
//!
//! First look at every upstream response. Decides whether it goes straight
//! back to the caller, becomes a permission error, or needs the session
//! policy. Transport failures are classified here too; none of them touch
//! session state.

use serde_json::{Map, Value};

use crate::error::Error;
use crate::request::ApiResponse;

/// Longest upstream body echoed into an error message.
const MAX_MESSAGE_LEN: usize = 512;

/// Flags an unauthorized response may carry.
///
/// Each field is read on its own: a malformed `reason` never hides
/// `sessionExpired`. A body that isn't a JSON object, or whose flag isn't a
/// boolean, reads as "no flag set".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnauthorizedSignal {
    pub session_expired: bool,
    pub reason: Option<String>,
}

impl UnauthorizedSignal {
    pub fn parse(body: &[u8]) -> Self {
        let Some(fields) = json_object(body) else {
            return Self::default();
        };
        let session_expired = ["sessionExpired", "session_expired"]
            .iter()
            .any(|key| fields.get(*key).and_then(Value::as_bool) == Some(true));
        Self {
            session_expired,
            reason: first_string(&fields, &["reason", "message"]),
        }
    }
}

fn json_object(body: &[u8]) -> Option<Map<String, Value>> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(fields)) => Some(fields),
        _ => None,
    }
}

/// First of `keys` whose value is a string.
fn first_string(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_str))
        .map(str::to_owned)
}

/// What to do with an upstream response.
#[derive(Debug)]
pub enum Verdict {
    /// Hand back to the caller unchanged: 2xx and every status other than
    /// 401/403.
    Deliver(ApiResponse),
    /// 403. Never triggers a refresh.
    Denied(Error),
    /// 401. The session policy decides.
    Unauthorized {
        response: ApiResponse,
        signal: UnauthorizedSignal,
    },
}

pub fn inspect(response: ApiResponse) -> Verdict {
    match response.status.as_u16() {
        401 => {
            let signal = UnauthorizedSignal::parse(&response.body);
            Verdict::Unauthorized { response, signal }
        }
        403 => Verdict::Denied(Error::PermissionDenied {
            status: 403,
            message: summarize(&response.body, "forbidden"),
        }),
        _ => Verdict::Deliver(response),
    }
}

/// Map a reqwest send/read failure onto the pipeline taxonomy.
pub fn classify_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else if e.is_builder() {
        Error::InvalidRequest(e.to_string())
    } else {
        Error::Network(e.to_string())
    }
}

/// Short human-readable message from an error body.
pub(crate) fn summarize(body: &[u8], fallback: &str) -> String {
    if let Some(message) =
        json_object(body).and_then(|fields| first_string(&fields, &["message", "reason", "error"]))
    {
        return truncate(message);
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        fallback.to_string()
    } else {
        truncate(text.to_string())
    }
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_MESSAGE_LEN {
        let mut end = MAX_MESSAGE_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("...");
    }
    text
}

//! Gateway error responses
//!
//! Every error the gateway produces is JSON:
//! `{"error":{"type","message","status","login_required","request_id"}}`.
//! `status` is the upstream status that caused the error, when there was one.

use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use session_pipeline::{Error, ErrorKind};

/// HTTP status the gateway answers with for a pipeline failure.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::AuthExpired | ErrorKind::SessionExpired | ErrorKind::Login => {
            StatusCode::UNAUTHORIZED
        }
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Network
        | ErrorKind::RefreshFailed
        | ErrorKind::Decode
        | ErrorKind::ResponseTooLarge => StatusCode::BAD_GATEWAY,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Store => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn pipeline_error_response(err: &Error, request_id: &str) -> Response {
    json_error(
        status_for(err.kind()),
        err.kind().label(),
        &err.to_string(),
        err.status(),
        err.requires_login(),
        request_id,
    )
}

pub fn json_error(
    status: StatusCode,
    error_type: &str,
    message: &str,
    upstream_status: Option<u16>,
    login_required: bool,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "status": upstream_status,
            "login_required": login_required,
            "request_id": request_id,
        }
    });
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

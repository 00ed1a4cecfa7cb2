//! Session endpoints
//!
//! - POST /session/login  - exchange credentials, persist the session
//! - POST /session/logout - clear the session (204 whether or not one existed)
//! - GET  /session        - token-free session summary and current state

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use session_auth::{LoginRequest, SessionSummary};
use session_pipeline::SessionManager;
use tracing::{info, warn};

use crate::error::{json_error, pipeline_error_response};
use crate::service::new_request_id;

#[derive(Serialize)]
struct SessionStatus {
    state: &'static str,
    #[serde(flatten)]
    summary: SessionSummary,
}

/// POST /session/login
///
/// Body: `{username, password, loginType?, captchaToken?}`. Returns the
/// identity on success. The password never reaches a log line.
pub async fn login(State(manager): State<Arc<SessionManager>>, body: Bytes) -> Response {
    let request_id = new_request_id();
    let request: LoginRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid login body: {e}"),
                None,
                false,
                &request_id,
            );
        }
    };

    match manager.login(&request).await {
        Ok(identity) => {
            info!(user_id = %identity.user_id, "login via gateway");
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "identity": identity,
                    "state": manager.state().await.label(),
                })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, username = %request.username, "login failed");
            pipeline_error_response(&e, &request_id)
        }
    }
}

/// POST /session/logout
pub async fn logout(State(manager): State<Arc<SessionManager>>) -> Response {
    match manager.logout().await {
        Ok(ended) => {
            info!(ended, "logout via gateway");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => pipeline_error_response(&e, &new_request_id()),
    }
}

/// GET /session
pub async fn status(State(manager): State<Arc<SessionManager>>) -> Response {
    let status = SessionStatus {
        state: manager.state().await.label(),
        summary: manager.summary().await,
    };
    (StatusCode::OK, Json(status)).into_response()
}

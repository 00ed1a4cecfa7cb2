//! Forwarding through the session pipeline
//!
//! Receives inbound requests, strips hop-by-hop headers and any client
//! credentials, and hands the request to the session manager, which attaches
//! the stored bearer token and deals with renewal. Upstream responses are
//! returned verbatim, including their error statuses; pipeline failures
//! become JSON error bodies.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use session_pipeline::{PendingRequest, SessionManager};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::{json_error, pipeline_error_response};
use crate::metrics;
use crate::service::ServiceMetrics;

/// Largest request body buffered for forwarding
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request headers never forwarded: credentials come from the session store
/// and the upstream host from the configured base URL.
const REPLACED_HEADERS: &[&str] = &["authorization", "cookie", "host"];

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub manager: Arc<SessionManager>,
    pub metrics: ServiceMetrics,
    /// Fired when the drain deadline passes; aborts requests still waiting
    pub shutdown: CancellationToken,
}

/// Forward an inbound request to the compliance API.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(state: &ProxyState, request: Request<Body>, request_id: String) -> Response {
    let _in_flight = state.metrics.track();
    let started = Instant::now();
    let method = request.method().clone();

    let response = forward(state, request, &request_id).await;

    let status = response.status().as_u16();
    metrics::record_request(status, method.as_str(), started.elapsed().as_secs_f64());
    info!(status, elapsed_ms = started.elapsed().as_millis() as u64, "request completed");
    response
}

async fn forward(state: &ProxyState, request: Request<Body>, request_id: &str) -> Response {
    let (parts, body) = request.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            state.metrics.record_error();
            error!(error = %e, "failed to read request body");
            return json_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                &format!("invalid request body: {e}"),
                None,
                false,
                request_id,
            );
        }
    };

    let mut pending = PendingRequest::new(parts.method, url).headers(forwardable(&parts.headers));
    if !body.is_empty() {
        pending = pending.body(body);
    }

    match state
        .manager
        .execute_with_cancel(pending, &state.shutdown)
        .await
    {
        Ok(upstream) => {
            let mut response = Response::builder().status(upstream.status);
            for (name, value) in &upstream.headers {
                if !is_hop_by_hop(name.as_str()) {
                    response = response.header(name, value);
                }
            }
            response
                .body(Body::from(upstream.body))
                .unwrap_or_else(|e| {
                    json_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "gateway_error",
                        &format!("response build error: {e}"),
                        None,
                        false,
                        request_id,
                    )
                })
        }
        Err(e) => {
            state.metrics.record_error();
            metrics::record_upstream_error(e.kind().label());
            if e.requires_login() {
                warn!(error = %e, "request needs a new login");
            } else {
                error!(error = %e, kind = e.kind().label(), "request failed");
            }
            pipeline_error_response(&e, request_id)
        }
    }
}

/// Copy of `headers` without hop-by-hop headers and client credentials.
pub fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str) || REPLACED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name_str)) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

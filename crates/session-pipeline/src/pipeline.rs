//! Session manager: the authenticated request pipeline
//!
//! Owns the credential store, the HTTP client and the refresh coordinator.
//! Construct one per process and share it; `teardown` releases it.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use chrono::Utc;
use session_auth::constants::DEFAULT_ACCESS_TTL_SECS;
use session_auth::{CredentialStore, Identity, LoginRequest, SessionSummary};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::guard::{self, Verdict};
use crate::policy::{self, Decision, SessionState};
use crate::refresh::{FailureCause, RefreshCoordinator, RefreshOutcome};
use crate::request::{ApiResponse, PendingRequest};

/// Per-request timeout when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest upstream response body buffered when none is configured.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Origin relative request URLs are resolved against
    pub api_base_url: String,
    /// Origin of the login and refresh endpoints
    pub auth_base_url: String,
    /// Applied to every send, including login and refresh
    pub timeout: Duration,
    /// Assumed access token lifetime when the server omits an expiry
    pub access_ttl: Duration,
    /// Upstream bodies larger than this fail with `ResponseTooLarge`
    pub max_response_bytes: usize,
}

impl PipelineConfig {
    /// Config with the API and auth endpoints on the same origin.
    pub fn new(api_base_url: impl Into<String>) -> Self {
        let api_base_url = api_base_url.into();
        Self {
            auth_base_url: api_base_url.clone(),
            api_base_url,
            timeout: DEFAULT_TIMEOUT,
            access_ttl: Duration::from_secs(DEFAULT_ACCESS_TTL_SECS),
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }

    pub fn with_auth_base_url(mut self, auth_base_url: impl Into<String>) -> Self {
        self.auth_base_url = auth_base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_access_ttl(mut self, access_ttl: Duration) -> Self {
        self.access_ttl = access_ttl;
        self
    }

    pub fn with_max_response_bytes(mut self, max_response_bytes: usize) -> Self {
        self.max_response_bytes = max_response_bytes;
        self
    }
}

pub struct SessionManager {
    config: PipelineConfig,
    store: Arc<CredentialStore>,
    client: reqwest::Client,
    refresher: RefreshCoordinator,
}

impl SessionManager {
    pub fn new(config: PipelineConfig, store: Arc<CredentialStore>, client: reqwest::Client) -> Self {
        let refresher = RefreshCoordinator::new(
            store.clone(),
            client.clone(),
            config.auth_base_url.clone(),
            config.timeout,
            config.access_ttl,
        );
        info!(
            api_base_url = %config.api_base_url,
            auth_base_url = %config.auth_base_url,
            timeout_secs = config.timeout.as_secs(),
            "session manager initialized"
        );
        Self {
            config,
            store,
            client,
            refresher,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Exchange credentials for a session and persist it.
    #[instrument(skip_all, fields(username = %request.username))]
    pub async fn login(&self, request: &LoginRequest) -> Result<Identity> {
        self.try_login(request).await.map_err(record_error)
    }

    async fn try_login(&self, request: &LoginRequest) -> Result<Identity> {
        let response = session_auth::login(
            &self.client,
            &self.config.auth_base_url,
            request,
            self.config.timeout,
        )
        .await
        .map_err(|e| match e {
            session_auth::Error::Timeout(m) => Error::Timeout(m),
            session_auth::Error::Http(m) => Error::Network(m),
            other => Error::Login(other.to_string()),
        })?;

        let (tokens, identity) = response.into_parts();
        let epoch = self
            .store
            .set(tokens, identity.clone())
            .await
            .map_err(Error::store)?;
        info!(user_id = %identity.user_id, epoch, "logged in");
        Ok(identity)
    }

    /// End the session. Returns whether there was one to end.
    pub async fn logout(&self) -> Result<bool> {
        self.end_session("user").await
    }

    /// Attach the current access token, if there is one.
    ///
    /// Without a token the request goes out as the caller built it.
    pub async fn prepare(&self, request: PendingRequest) -> Result<PendingRequest> {
        self.prepare_tracked(request).await.map(|(prepared, _)| prepared)
    }

    /// `prepare`, also returning the session epoch the token came from.
    async fn prepare_tracked(&self, request: PendingRequest) -> Result<(PendingRequest, u64)> {
        let (tokens, epoch) = self.store.tokens_with_epoch().await;
        let prepared = match tokens {
            Some(tokens) => request.with_bearer(&tokens.access_token)?,
            None => {
                debug!(url = request.url(), "no session, sending unauthenticated");
                request
            }
        };
        Ok((prepared, epoch))
    }

    /// Send a request, renewing the session and replaying once if needed.
    ///
    /// 2xx and ordinary error statuses come back as `Ok`. Transport
    /// failures, 403 and the session outcomes come back as `Err`.
    pub async fn execute(&self, request: PendingRequest) -> Result<ApiResponse> {
        self.run(request).await.map_err(record_error)
    }

    /// `execute`, abandoned with `Cancelled` once `cancel` fires.
    ///
    /// Cancelling never aborts a refresh other requests may be waiting on.
    pub async fn execute_with_cancel(
        &self,
        request: PendingRequest,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(record_error(Error::Cancelled)),
            result = self.run(request) => result.map_err(record_error),
        }
    }

    pub async fn state(&self) -> SessionState {
        if self.refresher.is_in_flight().await {
            SessionState::Refreshing
        } else if self.store.is_logged_in().await {
            SessionState::Authenticated
        } else {
            SessionState::LoggedOut
        }
    }

    pub async fn summary(&self) -> SessionSummary {
        self.store.summary(Utc::now()).await
    }

    /// Abort any running refresh and flush the store.
    pub async fn teardown(&self) -> Result<()> {
        self.refresher.abandon().await;
        self.store.save().await.map_err(Error::store)?;
        info!("session manager shut down");
        Ok(())
    }

    #[instrument(skip_all, fields(method = %request.method(), url = request.url()))]
    async fn run(&self, request: PendingRequest) -> Result<ApiResponse> {
        let mut request = request;
        loop {
            let (prepared, epoch) = self.prepare_tracked(request.clone()).await?;
            let sent_with = prepared.bearer_token().map(str::to_owned);
            let response = self.send(&prepared).await?;

            let (response, signal) = match guard::inspect(response) {
                Verdict::Deliver(response) => return Ok(response),
                Verdict::Denied(e) => return Err(e),
                Verdict::Unauthorized { response, signal } => (response, signal),
            };

            match policy::evaluate(response.status, &signal, request.retry()) {
                Decision::Continue => return Ok(response),
                Decision::HardLogout => {
                    let reason = signal
                        .reason
                        .unwrap_or_else(|| "session expired on the server".into());
                    let expired = Error::SessionExpired {
                        status: Some(response.status.as_u16()),
                        reason,
                    };
                    // Only the session this request was sent under is ended.
                    if self.end_session_if(epoch, "server_expired").await?
                        || !self.store.is_logged_in().await
                    {
                        warn!(error = %expired, "server ended the session");
                        return Err(expired);
                    }
                    info!("session expired for a superseded login, replaying with the current one");
                    request = request.into_retry().ok_or(expired)?;
                }
                Decision::SurfaceError => {
                    warn!("still unauthorized after token renewal");
                    return Err(Error::AuthExpired {
                        status: response.status.as_u16(),
                        message: guard::summarize(&response.body, "unauthorized"),
                    });
                }
                Decision::RefreshAndRetry => {
                    self.renew(sent_with.as_deref(), response.status.as_u16())
                        .await?;
                    request = request.into_retry().ok_or_else(|| Error::AuthExpired {
                        status: response.status.as_u16(),
                        message: "retry budget exhausted".into(),
                    })?;
                    debug!("replaying request with renewed token");
                }
            }
        }
    }

    /// Make sure the store holds a token newer than `sent_with`.
    async fn renew(&self, sent_with: Option<&str>, status: u16) -> Result<()> {
        // Another request may have renewed while this one was in flight.
        if let Some(current) = self.store.get().await
            && Some(current.access_token.as_str()) != sent_with
        {
            debug!("token renewed since this request was sent, skipping refresh");
            return Ok(());
        }

        match self.refresher.refresh().await {
            RefreshOutcome::Renewed(_) => Ok(()),
            RefreshOutcome::Failed(f) if f.session_ended => Err(Error::SessionExpired {
                status: Some(status),
                reason: f.reason,
            }),
            // A new login landed mid-refresh; replay with its token.
            RefreshOutcome::Failed(f) if f.cause == FailureCause::Superseded => Ok(()),
            RefreshOutcome::Failed(f) => Err(Error::RefreshFailed {
                status,
                reason: f.reason,
            }),
        }
    }

    async fn end_session(&self, reason: &'static str) -> Result<bool> {
        let cleared = self.store.clear().await.map_err(Error::store)?;
        record_logout(cleared, reason);
        Ok(cleared)
    }

    /// End the session only if no login happened since `epoch`.
    async fn end_session_if(&self, epoch: u64, reason: &'static str) -> Result<bool> {
        let cleared = self.store.clear_if(epoch).await.map_err(Error::store)?;
        record_logout(cleared, reason);
        Ok(cleared)
    }

    async fn send(&self, request: &PendingRequest) -> Result<ApiResponse> {
        let mut builder = self
            .client
            .request(
                request.method().clone(),
                resolve_url(&self.config.api_base_url, request.url()),
            )
            .headers(request.header_map().clone())
            .timeout(self.config.timeout);
        if let Some(body) = request.body_bytes() {
            builder = builder.body(body.clone());
        }

        let mut response = builder.send().await.map_err(guard::classify_transport)?;
        let status = response.status();
        let headers = response.headers().clone();

        let limit = self.config.max_response_bytes;
        let too_large = || Error::ResponseTooLarge {
            status: status.as_u16(),
            limit,
        };
        if response
            .content_length()
            .is_some_and(|len| len > limit as u64)
        {
            return Err(too_large());
        }
        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(guard::classify_transport)? {
            if body.len() + chunk.len() > limit {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        debug!(status = status.as_u16(), bytes = body.len(), "upstream responded");
        Ok(ApiResponse {
            status,
            headers,
            body: body.freeze(),
        })
    }
}

/// Absolute URLs pass through; anything else is a path under `base`.
fn resolve_url(base: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches('/')
        )
    }
}

fn record_logout(cleared: bool, reason: &'static str) {
    if cleared {
        metrics::counter!("session_logout_total", "reason" => reason).increment(1);
        info!(reason, "session ended");
    }
}

fn record_error(e: Error) -> Error {
    metrics::counter!("session_pipeline_errors_total", "kind" => e.kind().label()).increment(1);
    e
}

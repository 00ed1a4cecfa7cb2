//! Single-flight token refresh
//!
//! However many requests hit a 401 at once, at most one refresh call is on
//! the wire. The first caller spawns the refresh task; everyone arriving
//! while it runs awaits the same shared outcome. The task is spawned so a
//! caller dropping its request does not cancel the refresh for the rest.
//!
//! A successful refresh is written with the epoch it started under. If the
//! user logged out (or logged in again) meanwhile, the new pair is
//! discarded. A failed refresh ends the session only when both stored
//! tokens have expired locally; the clear happens inside the shared task so
//! it runs once no matter how many callers are waiting.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use session_auth::{CredentialStore, TokenPair};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::policy::{self, Decision, TokenValidity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// Nothing stored to refresh with
    NoSession,
    /// Auth server refused the refresh token
    Rejected,
    /// Auth server errored or answered with something unreadable
    Server,
    Network,
    Timeout,
    /// Logout or a new login landed while the refresh was in flight
    Superseded,
    /// The renewed pair could not be persisted
    Store,
    /// Refresh task was aborted (shutdown)
    Aborted,
}

impl FailureCause {
    pub fn label(&self) -> &'static str {
        match self {
            FailureCause::NoSession => "no_session",
            FailureCause::Rejected => "rejected",
            FailureCause::Server => "server_error",
            FailureCause::Network => "network_error",
            FailureCause::Timeout => "timeout",
            FailureCause::Superseded => "superseded",
            FailureCause::Store => "store_error",
            FailureCause::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefreshFailure {
    pub cause: FailureCause,
    pub reason: String,
    /// The store no longer holds a session.
    pub session_ended: bool,
}

#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    Renewed(TokenPair),
    Failed(RefreshFailure),
}

struct RefreshContext {
    store: Arc<CredentialStore>,
    client: reqwest::Client,
    auth_base_url: String,
    timeout: Duration,
    access_ttl: Duration,
}

struct InFlight {
    outcome: Shared<BoxFuture<'static, RefreshOutcome>>,
    abort: AbortHandle,
}

impl InFlight {
    fn is_running(&self) -> bool {
        !self.abort.is_finished()
    }
}

/// Owner of the one in-flight refresh.
pub struct RefreshCoordinator {
    ctx: Arc<RefreshContext>,
    in_flight: Mutex<Option<InFlight>>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        client: reqwest::Client,
        auth_base_url: impl Into<String>,
        timeout: Duration,
        access_ttl: Duration,
    ) -> Self {
        Self {
            ctx: Arc::new(RefreshContext {
                store,
                client,
                auth_base_url: auth_base_url.into(),
                timeout,
                access_ttl,
            }),
            in_flight: Mutex::new(None),
        }
    }

    /// Join the running refresh, or start one if none is running.
    pub async fn refresh(&self) -> RefreshOutcome {
        let outcome = {
            let mut slot = self.in_flight.lock().await;
            match slot.as_ref() {
                Some(in_flight) if in_flight.is_running() => {
                    debug!("joining in-flight token refresh");
                    in_flight.outcome.clone()
                }
                _ => {
                    debug!("starting token refresh");
                    let handle = tokio::spawn(run(self.ctx.clone()));
                    let abort = handle.abort_handle();
                    let outcome = async move {
                        handle.await.unwrap_or_else(|e| {
                            RefreshOutcome::Failed(RefreshFailure {
                                cause: FailureCause::Aborted,
                                reason: format!("refresh task ended early: {e}"),
                                session_ended: false,
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(InFlight {
                        outcome: outcome.clone(),
                        abort,
                    });
                    outcome
                }
            }
        };

        let result = outcome.clone().await;

        let mut slot = self.in_flight.lock().await;
        if slot
            .as_ref()
            .is_some_and(|in_flight| in_flight.outcome.ptr_eq(&outcome))
        {
            *slot = None;
        }
        result
    }

    pub async fn is_in_flight(&self) -> bool {
        self.in_flight
            .lock()
            .await
            .as_ref()
            .is_some_and(InFlight::is_running)
    }

    /// Abort a running refresh. Returns whether there was one.
    pub async fn abandon(&self) -> bool {
        match self.in_flight.lock().await.take() {
            Some(in_flight) if in_flight.is_running() => {
                in_flight.abort.abort();
                info!("aborted in-flight token refresh");
                true
            }
            _ => false,
        }
    }
}

fn record_outcome(outcome: &str) {
    metrics::counter!("session_refresh_total", "outcome" => outcome.to_string()).increment(1);
}

async fn run(ctx: Arc<RefreshContext>) -> RefreshOutcome {
    let (tokens, epoch) = ctx.store.tokens_with_epoch().await;
    let Some(previous) = tokens else {
        return fallback(
            &ctx,
            epoch,
            FailureCause::NoSession,
            "no refresh token stored".into(),
        )
        .await;
    };

    let issued_at = Utc::now();
    let result = session_auth::refresh_token(
        &ctx.client,
        &ctx.auth_base_url,
        &previous.refresh_token,
        ctx.timeout,
    )
    .await;

    let refreshed = match result {
        Ok(refreshed) => refreshed,
        Err(e) => {
            let cause = match &e {
                session_auth::Error::Timeout(_) => FailureCause::Timeout,
                session_auth::Error::Http(_) => FailureCause::Network,
                session_auth::Error::InvalidCredentials(_) => FailureCause::Rejected,
                _ => FailureCause::Server,
            };
            warn!(
                error = %e,
                cause = cause.label(),
                transport = e.is_transport(),
                "token refresh failed"
            );
            return fallback(&ctx, epoch, cause, e.to_string()).await;
        }
    };

    let pair = refreshed.into_pair(&previous, issued_at, ctx.access_ttl);
    match ctx.store.replace_tokens(epoch, pair.clone()).await {
        Ok(true) => {
            info!(epoch, "access token renewed");
            record_outcome("renewed");
            RefreshOutcome::Renewed(pair)
        }
        Ok(false) => {
            let session_ended = !ctx.store.is_logged_in().await;
            info!(session_ended, "session changed during refresh, discarded renewed tokens");
            record_outcome(FailureCause::Superseded.label());
            RefreshOutcome::Failed(RefreshFailure {
                cause: FailureCause::Superseded,
                reason: "session changed while refreshing".into(),
                session_ended,
            })
        }
        Err(e) => {
            warn!(error = %e, "failed to persist renewed tokens");
            record_outcome(FailureCause::Store.label());
            RefreshOutcome::Failed(RefreshFailure {
                cause: FailureCause::Store,
                reason: e.to_string(),
                session_ended: false,
            })
        }
    }
}

/// Keep the session if a stored token is still usable, otherwise end it.
async fn fallback(
    ctx: &RefreshContext,
    epoch: u64,
    cause: FailureCause,
    reason: String,
) -> RefreshOutcome {
    let now = Utc::now();
    let validity = TokenValidity {
        access: ctx.store.is_access_valid(now).await,
        refresh: ctx.store.is_refresh_valid(now).await,
    };
    record_outcome(cause.label());

    if policy::after_refresh_failure(validity) != Decision::HardLogout {
        info!(
            access_valid = validity.access,
            refresh_valid = validity.refresh,
            "keeping session, stored tokens are still time-valid"
        );
        return RefreshOutcome::Failed(RefreshFailure {
            cause,
            reason,
            session_ended: false,
        });
    }

    match ctx.store.clear_if(epoch).await {
        Ok(cleared) => {
            if cleared {
                warn!(cause = cause.label(), "both tokens expired, session ended");
                metrics::counter!("session_logout_total", "reason" => "refresh_failed")
                    .increment(1);
            }
            RefreshOutcome::Failed(RefreshFailure {
                cause,
                reason,
                session_ended: !ctx.store.is_logged_in().await,
            })
        }
        Err(e) => {
            warn!(error = %e, "failed to clear expired session");
            RefreshOutcome::Failed(RefreshFailure {
                cause: FailureCause::Store,
                reason: e.to_string(),
                session_ended: false,
            })
        }
    }
}

//! Authenticated request pipeline for the compliance API
//!
//! Every outbound call goes through `SessionManager`, which:
//! 1. Injects `Authorization: Bearer <access>` from the credential store
//! 2. Sends the request with a fixed timeout
//! 3. Runs the response through the guard (2xx and ordinary errors pass,
//!    403 is a permission error, 401 goes to the policy evaluator)
//! 4. On an ordinary 401, joins or starts the single shared refresh and
//!    replays the request exactly once
//! 5. On `sessionExpired`, or a failed refresh with both tokens locally
//!    expired, clears the store and reports `SessionExpired`
//!
//! Transport failures never touch session state.

pub mod error;
pub mod guard;
pub mod pipeline;
pub mod policy;
pub mod refresh;
pub mod request;
pub mod retry;

pub use error::{Error, ErrorKind, Result};
pub use guard::{UnauthorizedSignal, Verdict};
pub use pipeline::{DEFAULT_MAX_RESPONSE_BYTES, PipelineConfig, SessionManager};
pub use policy::{Decision, SessionState, TokenValidity};
pub use refresh::{FailureCause, RefreshCoordinator, RefreshFailure, RefreshOutcome};
pub use request::{ApiResponse, PendingRequest};
pub use retry::RetryPolicy;
pub use tokio_util::sync::CancellationToken;

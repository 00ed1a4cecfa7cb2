//! Per-request retry bookkeeping
//!
//! A request may be replayed at most once after a successful token
//! refresh. The policy is a value: advancing it returns a new policy, and
//! the one attached to a request is never mutated in place.

/// Attempt counter carried by each pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempt: u32,
    max_attempts: u32,
}

impl RetryPolicy {
    /// Number of replays allowed after the original send.
    pub const MAX_RETRIES: u32 = 1;

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether this request has already been replayed.
    pub fn is_retry(&self) -> bool {
        self.attempt > 0
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Policy for the replay, or `None` once the budget is spent.
    pub fn next(self) -> Option<Self> {
        self.can_retry().then(|| Self {
            attempt: self.attempt + 1,
            ..self
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt: 0,
            max_attempts: Self::MAX_RETRIES,
        }
    }
}

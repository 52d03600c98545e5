use crate::error::ApiError;

/// What to do after a failed upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry,
    Fail,
}

/// Decides *whether* to retry. How long to wait before the retry is the
/// governor's business, never the policy's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// `attempt` is 0-based (first failure => attempt=0).
    pub fn decide(&self, err: &ApiError, attempt: u32) -> Decision {
        if is_retryable(err) && attempt < self.max_retries {
            Decision::Retry
        } else {
            Decision::Fail
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

pub(crate) fn is_retryable(err: &ApiError) -> bool {
    match err {
        ApiError::RateLimited { .. } | ApiError::Transient { .. } => true,
        ApiError::Malformed { .. } => false,
    }
}

/// Whether the failure counts against the quota-specific backoff path.
pub(crate) fn is_rate_limit(err: &ApiError) -> bool {
    matches!(err, ApiError::RateLimited { .. })
}

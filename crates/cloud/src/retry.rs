//! Retry policy for remote storage requests
//!
//! Remote failures fall into three classes:
//! - TransientAuth: access denied or expired token. Credential refresh goes
//!   over HTTP too and can fail, so these are usually worth retrying.
//! - TransientInternal: internal failure, unknown error, or a message
//!   containing the exact lowercase phrase "try again". Retried up to
//!   `internal_failure_limit`.
//! - Other: everything else.
//!
//! `CloudRetryStrategy` only decides the TransientInternal case itself and
//! delegates every other decision, and every delay, to a `BackoffPolicy`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cumulus_core::ErrorClass;
use rand::Rng;
use tracing::{info, warn};

use crate::error::{CloudError, CloudErrorCode};

/// Default number of retries for TransientInternal failures
pub const DEFAULT_INTERNAL_FAILURE_LIMIT: u32 = 10;

/// Classify a remote error
pub fn classify(error: &CloudError) -> ErrorClass {
    if matches!(
        error.code,
        CloudErrorCode::InternalFailure | CloudErrorCode::Unknown
    ) || error.message.contains("try again")
    {
        return ErrorClass::TransientInternal;
    }
    if matches!(
        error.code,
        CloudErrorCode::AccessDenied | CloudErrorCode::ExpiredToken
    ) || error.exception == "AccessDenied"
        || error.exception == "ExpiredToken"
    {
        return ErrorClass::TransientAuth;
    }
    ErrorClass::Other
}

/// Decides whether and when to retry a failed request
///
/// `attempt` counts retries already made: 0 for the first failure.
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    /// True if the request should be retried
    fn should_retry(&self, error: &CloudError, attempt: u32) -> bool;

    /// How long to wait before the next attempt
    fn calculate_delay(&self, error: &CloudError, attempt: u32) -> Duration;
}

/// Exponential backoff over a list of retryable exception names
///
/// Retries while `attempt < max_retries` if the transport marked the error
/// retryable or its exception name is listed. The delay is
/// `scale_factor * 2^attempt` (0 for the first failure), capped at
/// `max_delay`, plus up to a quarter of that as random jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Retries allowed before giving up
    pub max_retries: u32,
    /// Base delay multiplied by 2^attempt
    pub scale_factor: Duration,
    /// Upper bound on the computed delay, before jitter
    pub max_delay: Duration,
    /// Add random jitter to each delay
    pub jitter: bool,
    /// Exception names retried regardless of the transport hint
    pub retryable_errors: Vec<String>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff {
            max_retries: 10,
            scale_factor: Duration::from_millis(25),
            max_delay: Duration::from_secs(60),
            jitter: true,
            retryable_errors: vec![
                "AccessDenied".to_string(),
                "ExpiredToken".to_string(),
                "InternalError".to_string(),
            ],
        }
    }
}

impl ExponentialBackoff {
    /// Default policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base delay
    pub fn with_scale_factor(mut self, scale_factor: Duration) -> Self {
        self.scale_factor = scale_factor;
        self
    }

    /// Set the delay cap
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Disable jitter, making delays deterministic
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        // Cap the shift to prevent overflow
        let multiplier = 1u32 << attempt.min(31);
        self.scale_factor
            .checked_mul(multiplier)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn should_retry(&self, error: &CloudError, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        error.retryable || self.retryable_errors.iter().any(|e| *e == error.exception)
    }

    fn calculate_delay(&self, _error: &CloudError, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let window = (base.as_millis() as u64 / 4).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=window))
    }
}

/// Retry strategy used for every remote request
///
/// Retries TransientInternal failures while `attempt <= internal_failure_limit`
/// and hands everything else to the wrapped default policy.
#[derive(Debug, Clone)]
pub struct CloudRetryStrategy {
    default_strategy: Arc<dyn BackoffPolicy>,
    internal_failure_limit: u32,
}

impl Default for CloudRetryStrategy {
    fn default() -> Self {
        CloudRetryStrategy::new(
            Arc::new(ExponentialBackoff::default()),
            DEFAULT_INTERNAL_FAILURE_LIMIT,
        )
    }
}

impl CloudRetryStrategy {
    /// Strategy over `default_strategy` with the given internal-failure budget
    pub fn new(default_strategy: Arc<dyn BackoffPolicy>, internal_failure_limit: u32) -> Self {
        info!(internal_failure_limit, "Configured cloud retry policy");
        CloudRetryStrategy {
            default_strategy,
            internal_failure_limit,
        }
    }

    /// Retries allowed for TransientInternal failures
    pub fn internal_failure_limit(&self) -> u32 {
        self.internal_failure_limit
    }

    /// The policy non-internal failures and all delays are delegated to
    pub fn default_strategy(&self) -> &Arc<dyn BackoffPolicy> {
        &self.default_strategy
    }
}

impl BackoffPolicy for CloudRetryStrategy {
    fn should_retry(&self, error: &CloudError, attempt: u32) -> bool {
        let limit = self.internal_failure_limit;
        if classify(error) == ErrorClass::TransientInternal {
            let retry = attempt <= limit;
            info!(
                code = %error.code,
                http_status = error.http_status,
                exception = %error.exception,
                attempt,
                limit,
                error_message = %error.message,
                "Encountered retriable failure, {}",
                if retry { "retrying" } else { "retry budget exhausted" }
            );
            return retry;
        }

        warn!(
            code = %error.code,
            http_status = error.http_status,
            exception = %error.exception,
            attempt,
            limit,
            error_message = %error.message,
            "Encountered remote failure, using default retry policy"
        );
        self.default_strategy.should_retry(error, attempt)
    }

    fn calculate_delay(&self, error: &CloudError, attempt: u32) -> Duration {
        self.default_strategy.calculate_delay(error, attempt)
    }
}

//! Bounded exponential backoff for service bootstrap.
//!
//! Publish and receive calls are never retried here: a failed message goes
//! back to the transport for redelivery. Backoff covers startup only, such as
//! reconciling topology while the broker is still coming up.
//!
//! # Example
//!
//! ```rust
//! use courier_runtime::backoff::{BackoffPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = BackoffPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(250))
//!     .max_delay(Duration::from_secs(10))
//!     .build();
//!
//! let partitions = retry_with_backoff(policy, "broker metadata", || async {
//!     Ok::<_, String>(3)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::BackoffMetrics;
use std::future::Future;
use std::time::Duration;

/// How often and how patiently a bootstrap step is retried.
///
/// The default allows 3 retries, starting at 100ms and doubling up to 30s.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Wait before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single wait
    pub max_delay: Duration,
    /// Growth factor between consecutive waits
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Start from the default policy and override individual settings.
    #[must_use]
    pub fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// A single attempt with no waiting, for services whose startup must not
    /// be repeated.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Wait before retry number `attempt + 1`.
    ///
    /// Grows as `initial_delay * multiplier^attempt` and never exceeds
    /// `max_delay`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let cap_ms = self.max_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if scaled_ms.is_finite() && scaled_ms < cap_ms {
            Duration::from_millis(scaled_ms as u64)
        } else {
            self.max_delay
        }
    }
}

/// Builder for [`BackoffPolicy`]; unset values keep their defaults.
#[derive(Debug, Clone)]
pub struct BackoffPolicyBuilder {
    policy: BackoffPolicy,
}

impl BackoffPolicyBuilder {
    /// Retries after the first attempt.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Wait before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Upper bound for any single wait.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Growth factor between consecutive waits.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Finish the policy.
    #[must_use]
    pub fn build(self) -> BackoffPolicy {
        self.policy
    }
}

/// Run a bootstrap step until it succeeds or `policy` runs out of retries.
///
/// `target` names what is being started and appears in every log line.
///
/// # Errors
///
/// The error of the final attempt.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: BackoffPolicy,
    target: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, target, operation, |_| true).await
}

/// [`retry_with_backoff`], except that errors rejected by `is_retryable`
/// end the attempts at once.
///
/// # Errors
///
/// The first error `is_retryable` rejects, or the error of the final attempt.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: BackoffPolicy,
    target: &str,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut retries = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if retries > 0 {
                    BackoffMetrics::record_success();
                    tracing::info!(target_name = target, retries, "Bootstrap step recovered");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) {
            tracing::error!(target_name = target, error = %err, "Bootstrap step failed permanently");
            return Err(err);
        }
        if retries == policy.max_retries {
            BackoffMetrics::record_exhausted();
            tracing::error!(
                target_name = target,
                retries,
                error = %err,
                "Bootstrap step still failing, giving up"
            );
            return Err(err);
        }

        let wait = policy.delay_for_attempt(retries);
        BackoffMetrics::record_attempt();
        tracing::warn!(
            target_name = target,
            retry = retries + 1,
            of = policy.max_retries,
            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Bootstrap step failed, waiting before retry"
        );
        tokio::time::sleep(wait).await;
        retries += 1;
    }
}

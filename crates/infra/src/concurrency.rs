//! Concurrency controller: bounded retry of whole ledger units.
//!
//! Every mutating ledger operation runs as one attempt closure. An attempt
//! that fails with a transient conflict (serialization failure, deadlock,
//! lock timeout) or whose staging outlives the attempt deadline is discarded
//! as a whole and retried after a growing, jittered delay. Any other error,
//! or success, returns at once.
//!
//! The deadline never covers a commit: a commit cut off mid-flight may still
//! land, and retrying it would apply the unit twice.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger_store::LedgerStoreError;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// base × 2^(attempt-1)
    Exponential,
    /// base × attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retries).
    pub max_attempts: u32,
    /// Base delay between attempts
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_millis(100))
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay of `base × attempt` after each failed attempt.
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: base_delay * max_attempts.max(1),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Nominal delay to wait after failed attempt `attempt` (1-indexed),
    /// before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };
        Duration::from_millis(delay_ms as u64)
    }

    /// [`Self::delay_for_attempt`] spread by up to `jitter` of itself in
    /// either direction.
    ///
    /// `seed` picks the point in that range; callers contending on the same
    /// account should pass different seeds so their retries fan out.
    pub fn jittered_delay(&self, attempt: u32, seed: u64) -> Duration {
        let delay_ms = self.delay_for_attempt(attempt).as_millis() as f64;
        let jitter_range = delay_ms * self.jitter;
        if jitter_range <= 0.0 {
            return Duration::from_millis(delay_ms as u64);
        }

        let unit = (splitmix64(seed ^ u64::from(attempt)) >> 11) as f64 / (1u64 << 53) as f64;
        let jitter = jitter_range * (unit - 0.5) * 2.0;
        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt may follow failed attempt `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Runs ledger units with bounded retry, and bounds the pre-commit phase of
/// each unit with a deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyController {
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), Duration::from_secs(10))
    }
}

impl ConcurrencyController {
    pub fn new(policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            policy,
            attempt_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Bound `staging` by the attempt deadline.
    ///
    /// Only wrap work whose cancellation leaves no trace, such as a unit that
    /// has not committed yet. An expired deadline is a transient error.
    pub async fn within_deadline<T, Fut>(&self, operation: &'static str, staging: Fut) -> Result<T, LedgerError>
    where
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        match tokio::time::timeout(self.attempt_timeout, staging).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Store(LedgerStoreError::Transient(format!(
                "{operation} attempt timed out after {}ms",
                self.attempt_timeout.as_millis()
            )))),
        }
    }

    /// Run `attempt` until it succeeds, fails permanently, or the policy is
    /// exhausted.
    ///
    /// The closure receives the 1-indexed attempt number. Each attempt must
    /// be self-contained: a dropped or failed attempt leaves no trace.
    /// Exhaustion surfaces as [`LedgerError::Unavailable`].
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T, LedgerError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        // v7 ids carry random low bits, distinct per call.
        let seed = Uuid::now_v7().as_u64_pair().1;
        let mut n = 1;
        loop {
            match attempt(n).await {
                Ok(value) => {
                    if n > 1 {
                        debug!(operation, attempts = n, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && self.policy.should_retry(n) => {
                    let delay = self.policy.jittered_delay(n, seed);
                    warn!(
                        operation,
                        attempt = n,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    n += 1;
                }
                Err(err) if err.is_retryable() => {
                    error!(operation, attempts = n, error = %err, "retries exhausted");
                    return Err(LedgerError::Unavailable {
                        attempts: n,
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}

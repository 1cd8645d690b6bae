//! Bounded retry with exponential back-off and jitter.
//!
//! Used by the role arbiter to dial the rendezvous socket: a handful of short
//! attempts, each failure followed by a small randomized pause so that racing
//! participants spread out instead of hammering the path in lockstep.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace};

/// Retry schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per call, including the first. Values below 1 count as 1.
    pub max_attempts: u32,
    /// Pause after the first failure.
    pub base_delay: Duration,
    /// Upper bound for any single pause.
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub exponential_base: f64,
    /// Scale each pause by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of attempts, including the first.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the pause after the first failure.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the cap on any single pause.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Pause before retry number `attempt` (0-indexed), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let grown = self.base_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        let capped = Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()));
        if self.jitter {
            jittered(capped).min(self.max_delay)
        } else {
            capped
        }
    }
}

/// Scale `delay` by a random factor in `[0.5, 1.5)`.
pub fn jittered(delay: Duration) -> Duration {
    let factor = rand::rng().random_range(0.5..1.5);
    delay.mul_f64(factor)
}

/// Outcome bookkeeping for one [`retry_async`] call.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub attempts: u32,
    pub total_delay: Duration,
    pub success: bool,
    pub last_error: Option<String>,
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget runs out.
pub async fn retry_async<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut stats = RetryStats::default();
    let mut attempt = 0;

    loop {
        stats.attempts = attempt + 1;
        let err = match operation().await {
            Ok(value) => {
                stats.success = true;
                if attempt > 0 {
                    debug!("Succeeded after {} attempts", attempt + 1);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };

        stats.last_error = Some(err.to_string());
        if !should_retry(&err) || attempt + 1 >= max_attempts {
            return (Err(err), stats);
        }

        let delay = policy.delay_for(attempt);
        stats.total_delay += delay;
        trace!(
            "Attempt {}/{} failed: {}. Retrying in {:?}",
            attempt + 1,
            max_attempts,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

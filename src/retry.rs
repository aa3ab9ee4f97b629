//! Retry policy value object and the cancellable loop that consumes it.

use crate::cancel::{sleep_cancellable, CancelToken};
use std::time::Duration;

/// Capped exponential backoff: `min(base * multiplier^attempt, max_delay)`.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        // 1 try + 5 retries, 1s doubling, like the throttling handler of the export API client.
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay, multiplier: multiplier.max(1.0), max_delay }
    }

    /// No retries at all: the first failure is final.
    pub fn none() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    Exhausted { attempts: usize, last: E },
    Fatal(E),
    Canceled,
}

/// Run `op` until it succeeds, fails with a non-transient error, the attempt budget runs out,
/// or `cancel` fires while backing off.
pub fn retry_transient<T, E, F, C>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    label: &str,
    is_transient: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Result<T, E>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 0..attempts {
        if cancel.is_canceled() {
            return Err(RetryError::Canceled);
        }
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if !is_transient(&e) => return Err(RetryError::Fatal(e)),
            Err(e) if attempt + 1 == attempts => {
                return Err(RetryError::Exhausted { attempts, last: e });
            }
            Err(e) => {
                let wait = policy.delay_for(attempt);
                tracing::warn!(
                    "{label}: transient failure ({e}); retry {}/{} in {:?}",
                    attempt + 1,
                    attempts - 1,
                    wait
                );
                if !sleep_cancellable(wait, cancel) {
                    return Err(RetryError::Canceled);
                }
            }
        }
    }
    Err(RetryError::Canceled)
}

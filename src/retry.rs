//! Bounded retries for transient failures, driven by the `backoff` crate.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use tracing::warn;

/// How many times to try an operation and how long to wait after the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,

    /// Delay after the first failure; doubles on each further failure
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, base_delay: Duration) -> Self {
        Self { attempts, base_delay }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts. The last error is returned.
pub async fn with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    is_transient: fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.base_delay)
        .with_randomization_factor(0.0)
        .with_multiplier(2.0)
        .with_max_interval(policy.base_delay.saturating_mul(8))
        .with_max_elapsed_time(None)
        .build();

    let max_attempts = policy.attempts.max(1);
    let mut attempt = 0u32;

    backoff::future::retry_notify(
        backoff,
        || {
            attempt += 1;
            let current = attempt;
            let fut = op();
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if current < max_attempts && is_transient(&e) => {
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        },
        |e: E, next: Duration| {
            warn!(
                op = what,
                error = %e,
                retry_in_ms = next.as_millis() as u64,
                "Transient failure, retrying"
            );
        },
    )
    .await
}

//! Bounded, fixed-delay retry used for activation polling, connectivity
//! checks and remote commands.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
    /// Pause between consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Six status checks, thirty seconds apart.
    pub const fn activation() -> Self {
        Self::new(6, Duration::from_secs(30))
    }

    /// One check plus six retries, thirty seconds apart.
    pub const fn connectivity() -> Self {
        Self::new(7, Duration::from_secs(30))
    }

    /// One run plus five retries, ten seconds apart.
    pub const fn command() -> Self {
        Self::new(6, Duration::from_secs(10))
    }

    pub const fn with_delay(self, delay: Duration) -> Self {
        Self::new(self.max_attempts, delay)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn into_last(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
        }
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` attempts have failed.
///
/// `op` receives the 1-based attempt number. The delay is only slept between
/// attempts, never after the last one.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                debug!(label, attempt, max_attempts, error = %e, "retrying after failure");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

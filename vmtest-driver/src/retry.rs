//! Fixed-interval polling with a hard attempt ceiling.
//!
//! Every blocking wait in the driver (boot signal, handshake, `wait_for_*`
//! helpers) goes through [`retry`].

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::DriverError;

/// Default number of attempts: 900 polls at one second is about 15 minutes.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 900;

/// Default pause between two attempts.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// How often and how long [`retry`] polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RetryPolicy {
    /// Total number of calls to the check, including the first one.
    pub max_attempts: u32,
    /// Sleep between two consecutive calls.
    pub interval: Duration,
}

impl RetryPolicy {
    /// Create a policy. A `max_attempts` of zero is treated as one.
    #[must_use]
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_INTERVAL)
    }
}

/// Polls `check` until it produces a value.
///
/// `check` returns `Ok(Some(v))` when the condition holds, `Ok(None)` for
/// "not yet", and `Err(_)` for a hard failure. It is called immediately, then
/// again after every `policy.interval` until `policy.max_attempts` calls have
/// been made. There is no sleep after the last attempt.
///
/// `what` names the awaited condition in logs and in the timeout error.
///
/// # Errors
/// Returns [`DriverError::Timeout`] when the attempts are exhausted. Any error
/// returned by `check` aborts the loop and is returned unchanged.
pub async fn retry<T, F, Fut>(what: &str, policy: RetryPolicy, mut check: F) -> Result<T, DriverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, DriverError>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        tracing::trace!(what, attempt, max_attempts, "condition not met yet");
        if attempt < max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    tracing::warn!(what, attempts = max_attempts, "retry budget exhausted");
    Err(DriverError::Timeout {
        what: what.to_owned(),
        attempts: max_attempts,
    })
}

//! Bounded polling for eventually-consistent convergence checks.
//!
//! Cluster convergence is asynchronous: a correct deployment takes an
//! unknown but bounded time to become observable. [`poll_until`] is the one
//! retry primitive the engine uses for that - it re-evaluates a probe at a
//! fixed interval until the probe holds or an explicit deadline elapses.
//!
//! # Invariants
//!
//! - Interval and timeout are mandatory arguments. There is no hidden
//!   default: the deadline is part of the caller's correctness contract.
//! - A probe error propagates immediately. Callers that consider a failure
//!   transient map it to `Ok(false)` inside their own probe.
//! - Waiting is cooperative (`tokio::time::sleep`); dropping the returned
//!   future cancels the poll and releases the timer.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Why a poll did not succeed.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The probe never held within the deadline.
    #[error("condition not met after {elapsed:?} ({attempts} attempts)")]
    Timeout { elapsed: Duration, attempts: u32 },

    /// The probe itself failed; not retried.
    #[error("probe failed: {0}")]
    Probe(#[source] E),
}

impl<E> PollError<E> {
    /// True when the poll ran out of time rather than hitting a probe error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::Timeout { .. })
    }
}

/// Evaluate `probe` until it returns `Ok(true)` or `timeout` elapses.
///
/// The probe runs once immediately, then every `interval` (the final sleep
/// is capped at the remaining budget so the deadline is honored). Returns
/// the number of attempts made on success.
pub async fn poll_until<F, Fut, E>(
    mut probe: F,
    interval: Duration,
    timeout: Duration,
) -> Result<u32, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<bool, E>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if probe().await.map_err(PollError::Probe)? {
            return Ok(attempts);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout {
                elapsed: now - start,
                attempts,
            });
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

//! Gives the control plane time to reconcile a change before it is observed.

use std::{future::Future, time::Duration};
use tokio::time;

/// Bounds polling for a condition with exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

/// Waits for convergence after a mutating control-plane call.
///
/// The default is a fixed pause. With a [`Backoff`], reads that have an
/// expected outcome may instead poll until the outcome is observed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Convergence {
    delay: Duration,
    poll: Option<Backoff>,
}

/// The last observation of a poll and whether it satisfied the condition.
#[derive(Clone, Debug, PartialEq)]
pub struct Polled<T> {
    pub value: T,
    pub satisfied: bool,
    pub attempts: u32,
}

// === impl Backoff ===

impl Backoff {
    pub const INITIAL_INTERVAL: Duration = Duration::from_millis(25);
    pub const MAX_INTERVAL: Duration = Duration::from_millis(500);

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            initial_interval: Self::INITIAL_INTERVAL,
            max_interval: Self::MAX_INTERVAL,
            timeout,
        }
    }

    fn next(&self, interval: Duration) -> Duration {
        interval.saturating_mul(2).min(self.max_interval)
    }
}

// === impl Convergence ===

impl Convergence {
    pub fn new(delay: Duration, poll: Option<Backoff>) -> Self {
        Self { delay, poll }
    }

    pub async fn pause(&self) {
        tracing::debug!(delay = ?self.delay, "Waiting for convergence");
        time::sleep(self.delay).await;
    }

    /// Observes with `observe` until `done` accepts an observation or the poll
    /// timeout elapses, returning the last observation either way. Without a
    /// poll configuration this observes exactly once.
    ///
    /// Errors from `observe` are returned immediately.
    pub async fn poll_until<T, E, F, Fut, P>(&self, mut observe: F, done: P) -> Result<Polled<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&T) -> bool,
    {
        let Some(backoff) = self.poll.as_ref() else {
            let value = observe().await?;
            let satisfied = done(&value);
            return Ok(Polled {
                value,
                satisfied,
                attempts: 1,
            });
        };

        let deadline = time::Instant::now() + backoff.timeout;
        let mut interval = backoff.initial_interval;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let value = observe().await?;
            if done(&value) {
                tracing::debug!(attempts, "Converged");
                return Ok(Polled {
                    value,
                    satisfied: true,
                    attempts,
                });
            }

            let now = time::Instant::now();
            if now >= deadline {
                tracing::debug!(attempts, timeout = ?backoff.timeout, "Did not converge");
                return Ok(Polled {
                    value,
                    satisfied: false,
                    attempts,
                });
            }

            let wait = interval.min(deadline - now);
            tracing::trace!(attempts, ?wait, "Not converged; retrying");
            time::sleep(wait).await;
            interval = backoff.next(interval);
        }
    }
}

impl Default for Convergence {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), None)
    }
}

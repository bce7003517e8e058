//! Bounded exponential-backoff polling.
//!
//! Shared by the build coordinator and the runtime controller. A timeout
//! only stops the local wait; whatever the remote side is doing carries on.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Shortest delay between two checks in milliseconds
pub const MIN_INTERVAL_MS: u64 = 1;

/// Polling schedule for a remote operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Delay after the first pending check in milliseconds
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,

    /// Upper bound for a single delay in milliseconds
    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each pending check)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Give up waiting after this many milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

fn default_initial_interval() -> u64 {
    2000
}
fn default_max_interval() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_timeout() -> u64 {
    600_000
} // 10 min

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval(),
            max_interval_ms: default_max_interval(),
            backoff_multiplier: default_backoff_multiplier(),
            timeout_ms: default_timeout(),
        }
    }
}

/// Result of one status check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    Pending,
    Done(T),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PollError<E> {
    /// The check itself reported a terminal error
    #[error(transparent)]
    Failed(E),

    #[error("gave up after {attempts} checks in {waited_ms}ms")]
    TimedOut { attempts: u32, waited_ms: u64 },
}

impl PollPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay after a pending check (1-indexed).
    ///
    /// Never shorter than [`MIN_INTERVAL_MS`] and never shrinking between
    /// attempts, whatever the configured values.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let floor = MIN_INTERVAL_MS as f64;
        let ceiling = self.max_interval_ms.max(MIN_INTERVAL_MS) as f64;
        let initial = self.initial_interval_ms.max(MIN_INTERVAL_MS) as f64;

        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = initial * multiplier.powi(exponent);

        Duration::from_millis(delay.clamp(floor, ceiling) as u64)
    }

    /// Run `check` until it is done, fails, or the timeout elapses.
    ///
    /// The first check runs immediately. The last sleep is shortened so the
    /// deadline is honoured, and one final check runs at the deadline. A
    /// check still outstanding at the deadline is abandoned.
    pub async fn poll_until<T, E, F, Fut>(&self, mut check: F) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollStatus<T>, E>>,
    {
        let started = Instant::now();
        let deadline = started + self.timeout();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let timed_out = |attempts: u32| PollError::TimedOut {
                attempts,
                waited_ms: Instant::now().duration_since(started).as_millis() as u64,
            };

            match tokio::time::timeout_at(deadline, check()).await {
                Ok(Ok(PollStatus::Done(value))) => return Ok(value),
                Ok(Ok(PollStatus::Pending)) => {}
                Ok(Err(e)) => return Err(PollError::Failed(e)),
                Err(_) => {
                    debug!(attempt, "status check outlived the deadline");
                    return Err(timed_out(attempt));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out(attempt));
            }

            let delay = self.delay_for_attempt(attempt).min(deadline - now);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "still pending");
            tokio::time::sleep(delay).await;
        }
    }
}

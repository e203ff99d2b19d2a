//! Bounded retry loop
//!
//! Retrying operations hand a probe closure to [`RetryPolicy::run`]. The
//! policy calls it at a fixed poll interval until it returns
//! [`Verdict::Done`] or [`Verdict::Fail`], the timeout elapses, or a stop
//! is requested.

use crate::common::config::TimeoutConfig;
use crate::common::shutdown::StopSignal;
use crate::common::{Error, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What a probe decided for this attempt.
#[derive(Debug)]
pub enum Verdict<T> {
    Done(T),
    Retry,
    Fail(Error),
}

/// Bookkeeping for one retrying operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    pub started_at: Instant,
    /// Attempts made so far, including the current one
    pub attempts: u32,
    pub deadline: Instant,
}

impl RetryContext {
    fn new(timeout: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            started_at,
            attempts: 0,
            deadline: started_at + timeout,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    pub fn from_config(timeouts: &TimeoutConfig) -> Self {
        Self::new(timeouts.retry_poll_interval, timeouts.retry_timeout)
    }

    /// Call `probe` until it settles. `what` names the operation in logs.
    ///
    /// The stop signal is checked after every attempt and interrupts the
    /// pause between attempts; an attempt in flight is never cancelled.
    pub async fn run<T, F, Fut>(&self, what: &str, stop: &StopSignal, mut probe: F) -> Result<T>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = Verdict<T>>,
    {
        let mut ctx = RetryContext::new(self.timeout);

        loop {
            if stop.is_stopped() {
                info!("Stop requested, giving up to {}", what);
                return Err(Error::Cancelled);
            }

            ctx.attempts += 1;
            match probe(ctx).await {
                Verdict::Done(value) => {
                    if ctx.attempts > 1 {
                        info!(
                            "Managed to {} after {} attempts in {:?}",
                            what,
                            ctx.attempts,
                            ctx.elapsed()
                        );
                    }
                    return Ok(value);
                }
                Verdict::Fail(e) => {
                    debug!("Failed to {}: {}", what, e);
                    return Err(e);
                }
                Verdict::Retry => {}
            }

            if stop.is_stopped() {
                info!("Stop requested, giving up to {}", what);
                return Err(Error::Cancelled);
            }

            if ctx.is_expired() {
                warn!(
                    "Failed to {} after {} attempts in {:?}, stopping now",
                    what,
                    ctx.attempts,
                    ctx.elapsed()
                );
                return Err(Error::Unreachable(format!(
                    "failed to {} after {} attempts in {:?}",
                    what,
                    ctx.attempts,
                    ctx.elapsed()
                )));
            }

            if ctx.attempts == 1 {
                warn!(
                    "Failed to {}, retrying every {:?} for up to {:?}",
                    what, self.poll_interval, self.timeout
                );
            } else {
                debug!("Failed to {} (attempt {})", what, ctx.attempts);
            }

            let pause = self.poll_interval.min(ctx.remaining());
            if stop.wait_timeout(pause).await {
                info!("Stop requested, giving up to {}", what);
                return Err(Error::Cancelled);
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TimeoutConfig::default())
    }
}

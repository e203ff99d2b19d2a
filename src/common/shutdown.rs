//! Interruptible stop signal for the keeper loop and retry waits.
//!
//! Waits race a timer against the signal, so a stop request wakes every
//! waiter immediately instead of after the full poll interval.
//!
//! ```ignore
//! let stop = StopSignal::new();
//! let stop_clone = stop.clone();
//!
//! // In the control loop:
//! while !stop_clone.is_stopped() {
//!     // do work ...
//!     stop_clone.wait_timeout(Duration::from_secs(5)).await;
//! }
//!
//! // From a signal handler:
//! stop.stop(StopMode::Graceful);
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How urgently the process was asked to stop. Ordered: a fast stop
/// overrides a graceful one, never the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopMode {
    Running,
    /// Finish the current cycle, then exit
    Graceful,
    /// Abort retries and exit as soon as possible
    Fast,
}

#[derive(Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<StopMode>>,
    rx: watch::Receiver<StopMode>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(StopMode::Running);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request a stop. Wakes all waiters.
    pub fn stop(&self, mode: StopMode) {
        self.tx.send_if_modified(|current| {
            if mode > *current {
                *current = mode;
                true
            } else {
                false
            }
        });
    }

    pub fn mode(&self) -> StopMode {
        *self.rx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.mode() != StopMode::Running
    }

    pub fn is_fast(&self) -> bool {
        self.mode() == StopMode::Fast
    }

    /// Sleep for at most `duration`, waking early on a stop request.
    /// Returns `true` when the caller should stop.
    pub async fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let mut rx = self.rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = rx.wait_for(|mode| *mode != StopMode::Running) => {}
        }
        self.is_stopped()
    }

    /// Resolve once a stop was requested.
    pub async fn stopped(&self) -> StopMode {
        let mut rx = self.rx.clone();
        // the sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|mode| *mode != StopMode::Running).await;
        self.mode()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_default_not_stopped() {
        let stop = StopSignal::new();
        assert!(!stop.is_stopped());
        assert_eq!(stop.mode(), StopMode::Running);
    }

    #[test]
    fn test_fast_overrides_graceful() {
        let stop = StopSignal::new();
        stop.stop(StopMode::Graceful);
        assert!(stop.is_stopped());
        assert!(!stop.is_fast());

        stop.stop(StopMode::Fast);
        assert!(stop.is_fast());

        stop.stop(StopMode::Graceful);
        assert!(stop.is_fast());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_stopped() {
        let stop = StopSignal::new();
        stop.stop(StopMode::Fast);
        let start = Instant::now();
        assert!(stop.wait_timeout(Duration::from_secs(10)).await);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_stop() {
        let stop = StopSignal::new();
        let waiter = stop.clone();
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            let stopped = waiter.wait_timeout(Duration::from_secs(10)).await;
            (stopped, start.elapsed())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.stop(StopMode::Graceful);
        let (stopped, elapsed) = handle.await.unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_wait_expires_normally() {
        let stop = StopSignal::new();
        let start = Instant::now();
        assert!(!stop.wait_timeout(Duration::from_millis(20)).await);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}

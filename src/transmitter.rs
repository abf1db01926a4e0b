//! Transmitter module - outbound side of a link
//!
//! Hosts the background send-drain loop and the bounded retry policy the
//! adapters wrap around their driver's send primitive.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::errors::Result;
use crate::remote_control::Link;
use crate::transport::Transport;

/// Transmitter - drains a link's send queue into its transport
pub struct Transmitter;

impl Transmitter {
    /// Background send-drain task
    ///
    /// Sleeps until the link signals a queued message, then sends every
    /// message currently queued before sleeping again. A signal raised while
    /// a drain is in progress is kept, so no message is left stranded.
    pub async fn drain_loop(link: Arc<Link>, transport: Arc<dyn Transport>) {
        loop {
            link.send_ready().notified().await;
            let sent = Self::drain(&link, transport.as_ref()).await;
            trace!(sent, "send queue drained");
        }
    }

    /// Send everything currently queued; returns the number of messages handed to the transport
    pub async fn drain(link: &Link, transport: &dyn Transport) -> usize {
        let mut sent = 0;
        while let Some(msg) = link.send_queue().try_pop() {
            debug!(kind = ?msg.kind(), "sending message");
            transport.low_level_send(&msg, link).await;
            sent += 1;
        }
        sent
    }
}

/// Bounded retry with optional exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    multiplier: u64,
}

impl RetryPolicy {
    /// Fixed delay between attempts
    pub fn new(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1,
        }
    }

    /// Grow the delay by `multiplier` per attempt, capped at `max_delay_ms`
    pub fn with_backoff(mut self, multiplier: u64, max_delay_ms: u64) -> Self {
        self.multiplier = multiplier.max(1);
        self.max_delay_ms = max_delay_ms.max(self.base_delay_ms);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after a failed attempt (0-based)
    ///
    /// Formula: delay = min(base_ms * (multiplier ^ attempt), max_delay_ms)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self
            .base_delay_ms
            .saturating_mul(self.multiplier.saturating_pow(attempt));
        Duration::from_millis(backoff.min(self.max_delay_ms))
    }

    /// Run `op` until it succeeds or attempts run out
    ///
    /// `op` receives the 0-based attempt number. Returns the number of
    /// attempts used on success, or the last error.
    pub async fn run<F, Fut>(&self, mut op: F) -> Result<u32>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(()) => return Ok(attempt + 1),
                Err(err) if attempt + 1 >= self.max_attempts => return Err(err),
                Err(err) => {
                    debug!(attempt, error = %err, "attempt failed, retrying");
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RcError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::new(3, 10);
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(5), Duration::from_millis(10));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::new(6, 100).with_backoff(2, 1000);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let used = RetryPolicy::new(3, 10)
            .run(|_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RcError::Driver("busy".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(used, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::new(3, 10)
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RcError::Driver("down".to_string())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

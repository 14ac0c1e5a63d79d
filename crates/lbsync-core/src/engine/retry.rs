//! Engine-owned retry of transient provider errors
//!
//! Providers are single-shot; the engine decides whether a failed call is
//! issued again. Only [`Error::TransientApi`] is retried, with exponential
//! backoff, and never past the operation's deadline.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::waiter::Deadline;

/// Bounded exponential backoff for transient errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Delay cap
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy from the engine configuration
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.retry_initial_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16) as u32);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op`, retrying transient failures
    ///
    /// `what` names the call for logs and for the timeout error. A call still
    /// in flight when `deadline` passes is abandoned with
    /// [`Error::ProvisioningTimeout`]; so is a retry whose backoff would end
    /// past the deadline.
    pub async fn run<T, F, Fut>(&self, what: &str, deadline: Deadline, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout_at(deadline.instant(), op()).await {
                Ok(result) => result,
                Err(_) => return Err(Error::timeout(what)),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    if deadline.remaining() <= delay {
                        warn!("{} failed ({}), no time left to retry", what, e);
                        return Err(Error::timeout(what));
                    }
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        attempt + 1,
                        self.max_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = policy(5);
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(350));
        assert_eq!(p.delay_for(60), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = policy(3)
            .run("list listeners", Deadline::after(Duration::from_secs(60)), move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::transient("503 Service Unavailable"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        tokio_test::assert_ok!(&result);
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = policy(2)
            .run("create pool", Deadline::after(Duration::from_secs(60)), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::transient("429 Too Many Requests")) }
            })
            .await;

        assert!(matches!(result, Err(Error::TransientApi(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = policy(5)
            .run("create load balancer", Deadline::after(Duration::from_secs(60)), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::validation("quota exceeded")) }
            })
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_the_deadline() {
        let result: Result<()> = policy(10)
            .run("create member", Deadline::after(Duration::from_millis(250)), || async {
                Err(Error::transient("connection reset"))
            })
            .await;

        assert!(matches!(result, Err(Error::ProvisioningTimeout { .. })));
    }
}

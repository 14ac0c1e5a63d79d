//! Provisioning waiter
//!
//! Blocks until a resource reaches a terminal provisioning status. The poll
//! interval starts at `poll_initial` and grows by `poll_factor` up to
//! `poll_max`. All waiting happens against one [`Deadline`] shared by the
//! whole reconciliation, so a long chain of dependent creates cannot exceed
//! the caller's budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::traits::{LoadBalancerClient, ProvisioningStatus, ResourceRef};

/// A point in time after which the current operation must give up
///
/// Built on [`tokio::time::Instant`], so it follows tokio's paused clock in
/// tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Longest budget a deadline represents (about one year)
    pub const FAR_FUTURE: Duration = Duration::from_secs(365 * 86_400);

    /// A deadline `budget` from now
    ///
    /// Budgets past [`Deadline::FAR_FUTURE`] are clamped to it.
    pub fn after(budget: Duration) -> Self {
        let now = Instant::now();
        let at = now
            .checked_add(budget.min(Self::FAR_FUTURE))
            .unwrap_or(now);
        Self { at }
    }

    /// The instant the deadline expires
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Time left; zero once expired
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Polls provisioning status until ACTIVE, ERROR or the deadline
#[derive(Clone)]
pub struct Waiter {
    client: Arc<dyn LoadBalancerClient>,
    poll_initial: Duration,
    poll_max: Duration,
    poll_factor: f64,
}

impl Waiter {
    /// Create a waiter using the engine's poll settings
    pub fn new(client: Arc<dyn LoadBalancerClient>, config: &EngineConfig) -> Self {
        Self {
            client,
            poll_initial: config.poll_initial(),
            poll_max: config.poll_max(),
            poll_factor: config.poll_factor,
        }
    }

    /// Wait for `resource` to become ACTIVE
    ///
    /// # Errors
    ///
    /// - [`Error::Provisioning`] if the provider reports ERROR
    /// - [`Error::ProvisioningTimeout`] if `deadline` passes first; a status
    ///   read in flight at that moment is abandoned
    /// - any non-transient error from the status read
    pub async fn wait_active(&self, resource: &ResourceRef, deadline: Deadline) -> Result<()> {
        match tokio::time::timeout_at(deadline.instant(), self.poll_until_terminal(resource)).await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("Deadline reached while waiting for {} to become ACTIVE", resource);
                Err(Error::timeout(resource.to_string()))
            }
        }
    }

    async fn poll_until_terminal(&self, resource: &ResourceRef) -> Result<()> {
        let mut delay = self.poll_initial;
        let mut polls: u32 = 0;

        loop {
            polls += 1;
            match self.client.provisioning_status(resource).await {
                Ok(ProvisioningStatus::Active) => {
                    debug!("{} is ACTIVE after {} poll(s)", resource, polls);
                    return Ok(());
                }
                Ok(ProvisioningStatus::Error) => {
                    return Err(Error::provisioning(resource.to_string()));
                }
                Ok(status) => {
                    debug!("{} is {} (poll {}), next poll in {:?}", resource, status, polls, delay);
                }
                Err(e) if e.is_transient() => {
                    warn!("Status read for {} failed, polling again: {}", resource, e);
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(delay).await;
            delay = next_delay(delay, self.poll_factor, self.poll_max);
        }
    }
}

/// Grow `current` by `factor`, capped at `max`
pub(crate) fn next_delay(current: Duration, factor: f64, max: Duration) -> Duration {
    Duration::try_from_secs_f64(current.as_secs_f64() * factor)
        .unwrap_or(max)
        .min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_is_capped() {
        let max = Duration::from_secs(10);
        let mut delay = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..20 {
            seen.push(delay);
            delay = next_delay(delay, 1.5, max);
        }

        assert!(seen.windows(2).all(|w| w[1] >= w[0]));
        assert_eq!(*seen.last().unwrap(), max);
        assert_eq!(next_delay(Duration::from_secs(2), 1.0, max), Duration::from_secs(2));
    }

    #[test]
    fn delay_growth_never_overflows() {
        let max = Duration::MAX;
        assert_eq!(next_delay(Duration::from_secs(u64::MAX / 2), 4.0, max), max);
        assert_eq!(next_delay(Duration::from_secs(1), f64::MAX, max), max);
    }

    #[tokio::test(start_paused = true)]
    async fn huge_budgets_are_clamped() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.is_expired());
        assert!(deadline.remaining() <= Deadline::FAR_FUTURE);
        assert!(deadline.remaining() > Duration::from_secs(86_400));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_tracks_paused_clock() {
        let deadline = Deadline::after(Duration::from_secs(30));
        assert!(!deadline.is_expired());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(deadline.remaining(), Duration::from_secs(20));

        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }
}

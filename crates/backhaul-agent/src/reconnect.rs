//! Reconnection policy with linear or exponential backoff

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `base × k`
    #[default]
    Linear,
    /// `base × 2^(k-1)`
    Exponential,
}

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failures tolerated before giving up (None = unlimited)
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub backoff: Backoff,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            base_delay: Duration::from_secs(5),
            backoff: Backoff::Linear,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Retry forever with exponential, capped delays
    pub fn unbounded(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: None,
            base_delay,
            backoff: Backoff::Exponential,
            max_delay,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before the next attempt after `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        let k = failures.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(k),
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(k - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Attempt counter for one agent, reset on every successful connection
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    failures: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record a failure. Returns the delay before the next attempt, or
    /// None once the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);

        if let Some(max_attempts) = self.policy.max_attempts {
            if self.failures > max_attempts {
                return None;
            }
        }

        let delay = self.policy.delay_for(self.failures);
        debug!(
            "Waiting {:?} before reconnection attempt {}",
            delay, self.failures
        );
        Some(delay)
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let policy = ReconnectPolicy::default();

        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(15));
        // Should cap at max_delay
        assert_eq!(policy.delay_for(20), Duration::from_secs(60));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = ReconnectPolicy::unbounded(Duration::from_millis(100), Duration::from_secs(2));

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1600));
        assert_eq!(policy.delay_for(6), Duration::from_secs(2));
        assert_eq!(policy.delay_for(64), Duration::from_secs(2));
    }

    #[test]
    fn test_budget_exhaustion() {
        let policy = ReconnectPolicy::default()
            .with_max_attempts(Some(3))
            .with_base_delay(Duration::from_secs(1));
        let mut state = ReconnectState::new(policy);

        assert_eq!(state.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(state.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(state.next_delay(), Some(Duration::from_secs(3)));
        assert_eq!(state.next_delay(), None);
        assert_eq!(state.failures(), 4);
    }

    #[test]
    fn test_reset() {
        let mut state = ReconnectState::new(ReconnectPolicy::default());

        state.next_delay();
        state.next_delay();
        assert_eq!(state.failures(), 2);

        state.reset();

        assert_eq!(state.failures(), 0);
        assert_eq!(state.next_delay(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_unbounded_never_exhausts() {
        let mut state = ReconnectState::new(ReconnectPolicy::unbounded(
            Duration::from_secs(1),
            Duration::from_secs(30),
        ));
        for _ in 0..1000 {
            assert!(state.next_delay().is_some());
        }
    }
}

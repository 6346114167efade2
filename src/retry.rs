//! Bounded retry with a fixed cooldown.
//!
//! One [`RetryPolicy`] shape is shared by every retrying loop in the daemon:
//! the watcher's stream re-subscription, inline dispatch retries and the
//! supervisor's restart cycles. Each loop owns a [`RetryBudget`] that counts
//! consecutive failures against the policy and is reset by a success.

use std::time::Duration;

/// How many consecutive failures are tolerated, and how long to wait between
/// attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures allowed before giving up. Values below 1 are treated as 1.
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            cooldown,
        }
    }

    pub fn budget(self) -> RetryBudget {
        RetryBudget::new(self)
    }
}

/// What to do after recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `cooldown`, then try again. `attempt` is the failure count so far.
    Retry { attempt: u32, cooldown: Duration },
    /// The policy is used up after `attempts` consecutive failures.
    Exhausted { attempts: u32 },
}

/// Consecutive-failure counter for one retrying loop.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    policy: RetryPolicy,
    failures: u32,
}

impl RetryBudget {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Count one failure and decide whether another attempt is allowed.
    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts {
            RetryDecision::Exhausted {
                attempts: self.failures,
            }
        } else {
            RetryDecision::Retry {
                attempt: self.failures,
                cooldown: self.policy.cooldown,
            }
        }
    }

    /// A success clears the failure history.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

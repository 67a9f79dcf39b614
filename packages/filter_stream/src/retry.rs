//! Bounded, fixed-delay recovery from unplanned disconnects.

use std::time::Duration;

use tokio::time::Instant;

/// Default number of reconnect attempts after an unplanned disconnect.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default pause between consecutive failed attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How hard to try to get the shared connection back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Begin a retry sequence for a fresh unplanned disconnect.
    pub fn start(&self) -> RetryState {
        RetryState {
            policy: *self,
            attempts: 0,
            resume_at: None,
        }
    }
}

/// What to do after an attempt in the sequence failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStep {
    /// Try again once the clock reaches this instant.
    Wait(Instant),
    /// The attempt budget is spent.
    Exhausted,
}

/// Progress of one retry sequence.
///
/// The first attempt happens immediately; each later attempt happens `delay`
/// after the previous one failed. A sequence ends on success, when the filter
/// set empties, or after `max_attempts` failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
    resume_at: Option<Instant>,
}

impl RetryState {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// When the pending wait ends, if one is pending.
    pub fn resume_at(&self) -> Option<Instant> {
        self.resume_at
    }

    /// Record the start of an attempt, cancelling any pending wait.
    ///
    /// Returns the 1-based attempt number, or `None` if the budget is spent.
    pub fn start_attempt(&mut self) -> Option<u32> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        self.resume_at = None;
        Some(self.attempts)
    }

    /// Record a failed attempt and decide whether another one follows.
    pub fn attempt_failed(&mut self, now: Instant) -> RetryStep {
        if self.attempts >= self.policy.max_attempts {
            self.resume_at = None;
            return RetryStep::Exhausted;
        }
        let at = now + self.policy.delay;
        self.resume_at = Some(at);
        RetryStep::Wait(at)
    }
}

use std::time::Duration;

/// What a stage deadline overrun means for the cascade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Fail closed: the overrun is recorded and the trigger is rejected.
    Reject,
    /// Retry per the stage's `RetryPolicy`; exhaustion ends in `TimedOut`.
    Retry,
}

/// Bounded exponential backoff. `max_attempts` counts every attempt,
/// including the first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based) failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    pub fn allows_another(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagePolicy {
    pub deadline: Duration,
    pub on_timeout: TimeoutPolicy,
    pub retry: RetryPolicy,
}

impl StagePolicy {
    /// Cheap local stages: short deadline, fail closed on overrun.
    pub fn fail_closed(deadline: Duration) -> Self {
        Self {
            deadline,
            on_timeout: TimeoutPolicy::Reject,
            retry: RetryPolicy::no_retry(),
        }
    }

    pub fn retrying(deadline: Duration, retry: RetryPolicy) -> Self {
        Self {
            deadline,
            on_timeout: TimeoutPolicy::Retry,
            retry,
        }
    }
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self::fail_closed(Duration::from_millis(500))
    }
}

use std::time;

/// Bounded exponential backoff used when publishing a batch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The wait after the first failed attempt.
    initial_interval: time::Duration,
    /// The maximum possible wait between attempts.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            max_attempts,
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait before the attempt following the zero-based `attempt` that just failed.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let factor = self.backoff_coefficient.saturating_pow(attempt);
        let candidate_interval = self.initial_interval.saturating_mul(factor);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Whether another attempt may follow the zero-based `attempt` that just failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

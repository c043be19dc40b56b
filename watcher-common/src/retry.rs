use std::time;

/// Backoff schedule consulted between delivery attempts.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
        }
    }

    /// Calculate the time to wait after the given attempt (1-based) before
    /// trying again.
    pub fn time_until_next_retry(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self.initial_interval * self.backoff_coefficient.pow(attempt);

        if let Some(max_interval) = self.maximum_interval {
            std::cmp::min(candidate_interval, max_interval)
        } else {
            candidate_interval
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_doubles() {
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.time_until_next_retry(1),
            time::Duration::from_secs(2)
        );
        assert_eq!(
            policy.time_until_next_retry(2),
            time::Duration::from_secs(4)
        );
        assert_eq!(
            policy.time_until_next_retry(3),
            time::Duration::from_secs(8)
        );
    }

    #[test]
    fn test_maximum_interval_caps_backoff() {
        let policy = RetryPolicy::new(
            2,
            time::Duration::from_secs(1),
            Some(time::Duration::from_secs(3)),
        );

        assert_eq!(
            policy.time_until_next_retry(1),
            time::Duration::from_secs(2)
        );
        assert_eq!(
            policy.time_until_next_retry(5),
            time::Duration::from_secs(3)
        );
    }
}

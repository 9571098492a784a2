//! # Retry
//!
//! The two retry layers of the pipeline and their bounds:
//! * `RetryPolicy`: attempts made by the parser against the credential pool for one delivery.
//! * `RedeliveryPolicy`: deliveries of one message by its channel before it is dead-lettered.
//!
//! The worst case number of external calls for one message is the product of both bounds.
use std::time;

#[derive(Clone, Debug, PartialEq, Eq)]
/// A retry policy for attempts made within a single delivery.
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The interval before the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible interval between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(max_attempts: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(max_attempts, initial_interval)
    }

    /// Interval to wait after failed attempt number `attempt` (1-based).
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match (candidate_interval, self.maximum_interval) {
            (Some(interval), Some(max_interval)) => std::cmp::min(interval, max_interval),
            (Some(interval), None) => interval,
            (None, Some(max_interval)) => max_interval,
            (None, None) => time::Duration::MAX,
        }
    }

    /// Whether another attempt is allowed after attempt number `attempt` failed.
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_attempts: u32,
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_coefficient: 1,
            initial_interval: time::Duration::from_secs(2),
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(max_attempts: u32, initial_interval: time::Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn backoff_coefficient(mut self, coefficient: u32) -> RetryPolicyBuilder {
        self.backoff_coefficient = coefficient.max(1);
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

/// How many times a channel delivers the same message before giving up on it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// `None` redelivers forever, which lets a poison message cycle indefinitely.
    pub max_deliveries: Option<u32>,
}

impl RedeliveryPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_deliveries: None,
        }
    }

    pub fn bounded(max_deliveries: u32) -> Self {
        Self {
            max_deliveries: Some(max_deliveries.max(1)),
        }
    }

    /// Whether a message that just failed its `deliveries`-th delivery goes back to the queue.
    pub fn should_requeue(&self, deliveries: u32) -> bool {
        match self.max_deliveries {
            Some(max_deliveries) => deliveries < max_deliveries,
            None => true,
        }
    }

    /// Upper bound of external calls made for one message, if bounded.
    pub fn worst_case_attempts(&self, retry_policy: &RetryPolicy) -> Option<u64> {
        self.max_deliveries
            .map(|deliveries| u64::from(deliveries) * u64::from(retry_policy.max_attempts))
    }
}

//! Session configuration

use crate::{Address, Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeout and retry budget for a single delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled after each failure
    pub initial_backoff: Duration,
    /// Upper limit for the backoff delay
    pub max_backoff: Duration,
    /// Bound on a single attempt
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, attempt_timeout: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "Retry policy needs at least one attempt".into(),
            ));
        }
        if attempt_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "Attempt timeout must be positive".into(),
            ));
        }

        Ok(Self {
            max_attempts,
            initial_backoff,
            max_backoff: Duration::from_secs(10).max(initial_backoff),
            attempt_timeout,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

/// Configuration of a participant session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Number of participants N
    pub participant_count: usize,
    /// Exclusive upper bound for generated shares
    pub bound_max: i64,
    /// Address peers and the coordinator reach this participant at
    pub self_address: Address,
    /// Address of the coordinator
    pub coordinator_address: Address,
    /// Delivery policy for every outbound request
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl SessionConfig {
    /// Create a new participant configuration
    ///
    /// `bound_max` must be at least `participant_count` so that the secret
    /// range `[0, bound_max / N)` is non-empty, and small enough that sums
    /// of N aggregates cannot leave the i64 range.
    pub fn new(
        participant_count: usize,
        bound_max: i64,
        self_address: Address,
        coordinator_address: Address,
    ) -> Result<Self> {
        validate_count(participant_count)?;

        let n = participant_count as i64;
        if bound_max < n {
            return Err(Error::InvalidConfig(format!(
                "Bound {} must be at least the participant count {}",
                bound_max, participant_count
            )));
        }
        // Worst case magnitude of the coordinator's running total.
        let limit = n
            .checked_mul(n)
            .and_then(|v| v.checked_mul(2))
            .and_then(|v| v.checked_mul(bound_max));
        if limit.is_none() {
            return Err(Error::InvalidConfig(format!(
                "Bound {} is too large for {} participants",
                bound_max, participant_count
            )));
        }
        if self_address == coordinator_address {
            return Err(Error::InvalidConfig(
                "Participant and coordinator addresses must differ".into(),
            ));
        }

        Ok(Self {
            participant_count,
            bound_max,
            self_address,
            coordinator_address,
            retry: RetryPolicy::default(),
        })
    }

    /// Set the delivery policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Exclusive upper bound for this participant's secret value
    pub fn secret_limit(&self) -> i64 {
        self.bound_max / self.participant_count as i64
    }
}

/// Configuration of the coordinator session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Quorum N of registrations and reports
    pub participant_count: usize,
    /// Address the coordinator is reached at
    pub self_address: Address,
    /// Delivery policy for peer-set broadcasts
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl CoordinatorConfig {
    pub fn new(participant_count: usize, self_address: Address) -> Result<Self> {
        validate_count(participant_count)?;

        Ok(Self {
            participant_count,
            self_address,
            retry: RetryPolicy::default(),
        })
    }

    /// Set the delivery policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn validate_count(participant_count: usize) -> Result<()> {
    if participant_count == 0 {
        return Err(Error::InvalidConfig(
            "At least one participant is required".into(),
        ));
    }
    if i64::try_from(participant_count).is_err() {
        return Err(Error::InvalidConfig("Participant count is too large".into()));
    }
    Ok(())
}

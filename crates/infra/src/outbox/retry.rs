//! Redelivery policy for failed outbox messages.

use std::time::Duration;

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use stockbook_outbox::DeliveryFailure;

/// Backoff strategy for redelivery delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every attempt
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!("unknown backoff strategy: {other}")),
        }
    }
}

/// Retry policy applied by the outbox relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed deliveries allowed before a message is dead-lettered
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Dead-letter on the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before redelivering after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * f64::from(attempt)).min(max_ms),
        };

        // Deterministic spread so relays retrying together drift apart.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let spread = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
            jitter_range * (spread - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether a message that has failed `attempt` times may be redelivered.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Decide the fate of a message whose `attempt`-th delivery just failed.
    pub fn failure_for(
        &self,
        attempt: u32,
        retriable: bool,
        error: String,
        now: DateTime<Utc>,
    ) -> DeliveryFailure {
        if !retriable || !self.should_retry(attempt) {
            return DeliveryFailure::DeadLetter { error };
        }
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        DeliveryFailure::Retry {
            error,
            next_attempt_at: now + delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn linear_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(1),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(1));
    }

    #[test]
    fn permanent_errors_dead_letter_immediately() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(10));
        let now = Utc::now();

        assert!(matches!(
            policy.failure_for(1, false, "bad payload".into(), now),
            DeliveryFailure::DeadLetter { .. }
        ));
        match policy.failure_for(1, true, "lock timeout".into(), now) {
            DeliveryFailure::Retry { next_attempt_at, .. } => {
                assert_eq!(next_attempt_at, now + chrono::Duration::milliseconds(10));
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert!(matches!(
            policy.failure_for(3, true, "lock timeout".into(), now),
            DeliveryFailure::DeadLetter { .. }
        ));
    }

    #[test]
    fn strategy_parses_from_config_values() {
        assert_eq!("Linear".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Linear));
        assert!("random".parse::<BackoffStrategy>().is_err());
    }
}

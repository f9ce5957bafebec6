//! Retry scheduling and dead-lettering after each delivery attempt.
//!
//! [`RetryPolicy::on_outcome`] is the single place a delivery's status,
//! attempt count and next attempt time change after an attempt. It is a pure
//! function of the delivery, the outcome and the current time; the caller
//! persists the result with one conditional write.

use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_core::{Delivery, DeliveryStatus};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::client::AttemptOutcome;

/// Retry policy configuration.
///
/// `max_attempts` is stamped onto deliveries when they are created; the
/// scheduler always honors the value stored on the delivery itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts a new delivery gets, including the first.
    pub max_attempts: u32,

    /// Unit of the backoff schedule.
    pub base_interval: Duration,

    /// Upper bound for any single delay.
    pub max_interval: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(3600),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Linear,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay after every failure.
    Fixed,
    /// Delay doubles each attempt: `base * 2^(attempts - 1)`.
    Exponential,
    /// Delay grows by `base` each attempt: `base * attempts`.
    #[default]
    Linear,
}

impl RetryPolicy {
    /// Delay before the next attempt once `attempt_count` attempts failed.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let attempts = attempt_count.max(1);
        let delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_interval,
            BackoffStrategy::Linear => self.base_interval.saturating_mul(attempts),
            BackoffStrategy::Exponential => {
                let exponent = (attempts - 1).min(20);
                self.base_interval.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };

        let capped = delay.min(self.max_interval);
        apply_jitter(capped, self.jitter_factor).min(self.max_interval)
    }

    /// Applies the outcome of one attempt to a claimed delivery.
    ///
    /// Every attempt consumes one unit of the attempt budget. A 2xx
    /// completes the delivery. A failure reschedules it while budget
    /// remains and dead-letters it otherwise. Deliveries already in a
    /// terminal state are returned unchanged.
    pub fn on_outcome(
        &self,
        mut delivery: Delivery,
        outcome: &AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Delivery {
        if delivery.is_terminal() {
            return delivery;
        }

        delivery.attempt_count = (delivery.attempt_count + 1).min(delivery.max_attempts);
        delivery.last_response_code = outcome.status_code().map(i32::from);
        delivery.updated_at = now;

        if outcome.is_success() {
            delivery.status = DeliveryStatus::Success;
            delivery.last_error = None;
            delivery.completed_at = Some(now);
            delivery.next_attempt_at = None;
            return delivery;
        }

        delivery.last_error = outcome.error_message();

        if delivery.attempt_count >= delivery.max_attempts {
            delivery.status = DeliveryStatus::Failed;
            delivery.next_attempt_at = None;
        } else {
            let attempts = u32::try_from(delivery.attempt_count).unwrap_or(u32::MAX);
            let delay = chrono::Duration::from_std(self.delay_for(attempts))
                .unwrap_or(chrono::Duration::MAX);
            delivery.status = DeliveryStatus::Pending;
            delivery.next_attempt_at = Some(now.checked_add_signed(delay).unwrap_or(now));
        }

        delivery
    }
}

/// Applies jitter to a duration to spread retries of a burst.
///
/// Randomizes the delay by ±jitter_factor percentage. For example, with
/// jitter_factor=0.25, a 10s delay becomes 7.5s to 12.5s randomly.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

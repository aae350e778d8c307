//! Backoff strategies: attempt number → delay.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Largest jitter fraction accepted; the range is half-open `[0, 1)`.
const MAX_JITTER: f64 = 0.999;

/// Shape of the delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * multiplier^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Delay configuration for retries and requeues.
///
/// `base_delay_for` is the pre-jitter curve and is monotonically
/// non-decreasing in the attempt number, never exceeding `max_delay`.
/// `delay` perturbs it by a uniform `1 ± jitter` factor and clamps the
/// result back into `[0, max_delay]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay curve
    pub strategy: BackoffStrategy,
    /// Delay for the first retry
    pub base_delay: Duration,
    /// Growth factor for `Exponential` (values below 1.0 are treated as 1.0)
    pub multiplier: f64,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Jitter fraction in `[0, 1)`
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

impl Backoff {
    /// No delay at all (retries happen immediately).
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Constant delay, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    /// Linear growth up to `max_delay`, no jitter.
    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_delay,
            multiplier: 1.0,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Doubling delays up to `max_delay` with 10% jitter.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            multiplier: 2.0,
            max_delay,
            jitter: 0.1,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check the configuration against its documented ranges.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(PolicyError::invalid(format!(
                "jitter must be in [0, 1), got {}",
                self.jitter
            )));
        }
        if !(self.multiplier >= 1.0) {
            return Err(PolicyError::invalid(format!(
                "multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Pre-jitter delay for a given attempt number (1-indexed).
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay.as_nanos() as f64;
        let max = self.max_delay.as_nanos() as f64;

        let raw = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * f64::from(attempt),
            BackoffStrategy::Exponential => {
                let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
                base * self.multiplier.max(1.0).powi(exponent)
            }
        };

        // `min` discards NaN and saturates infinities at the cap.
        Duration::from_nanos(raw.min(max).max(0.0) as u64)
    }

    /// Jittered delay for a given attempt, using the thread-local RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::rng())
    }

    /// Jittered delay for a given attempt, drawing from `rng`.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay_for(attempt);
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, MAX_JITTER)
        } else {
            0.0
        };

        if jitter == 0.0 || base.is_zero() {
            return base;
        }

        let factor = 1.0 + rng.random_range(-jitter..jitter);
        let nanos = (base.as_nanos() as f64 * factor).clamp(0.0, self.max_delay.as_nanos() as f64);
        Duration::from_nanos(nanos as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter(strategy: BackoffStrategy) -> Backoff {
        Backoff {
            strategy,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        }
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let backoff = no_jitter(BackoffStrategy::Exponential);

        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_respects_multiplier() {
        let backoff = no_jitter(BackoffStrategy::Exponential).with_multiplier(3.0);

        assert_eq!(backoff.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.base_delay_for(2), Duration::from_millis(300));
        assert_eq!(backoff.base_delay_for(3), Duration::from_millis(900));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::fixed(Duration::from_millis(500));

        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_millis(500));
        assert_eq!(backoff.delay(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let backoff = no_jitter(BackoffStrategy::Linear);

        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(300));
    }

    #[test]
    fn delay_is_capped() {
        let backoff = no_jitter(BackoffStrategy::Exponential);
        assert_eq!(backoff.delay(30), Duration::from_secs(10));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(Backoff::default().delay(0), Duration::ZERO);
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        assert!(Backoff::default().validate().is_ok());
        assert!(Backoff::default().with_jitter(1.0).validate().is_err());
        assert!(Backoff::default().with_jitter(-0.1).validate().is_err());
        assert!(Backoff::default().with_multiplier(0.5).validate().is_err());
    }

    proptest! {
        #[test]
        fn pre_jitter_delay_is_monotonic_and_capped(
            base_ms in 0u64..5_000,
            max_ms in 0u64..120_000,
            multiplier in 1.0f64..5.0,
            strategy in prop_oneof![
                Just(BackoffStrategy::Fixed),
                Just(BackoffStrategy::Linear),
                Just(BackoffStrategy::Exponential),
            ],
            attempt in 1u32..64,
        ) {
            let backoff = Backoff {
                strategy,
                base_delay: Duration::from_millis(base_ms),
                multiplier,
                max_delay: Duration::from_millis(max_ms),
                jitter: 0.0,
            };

            let current = backoff.base_delay_for(attempt);
            let next = backoff.base_delay_for(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(current <= backoff.max_delay);
        }

        #[test]
        fn jittered_delay_never_exceeds_cap(
            base_ms in 1u64..5_000,
            max_ms in 1u64..60_000,
            jitter in 0.0f64..0.99,
            attempt in 1u32..32,
        ) {
            let backoff = Backoff::exponential(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            )
            .with_jitter(jitter);

            prop_assert!(backoff.delay(attempt) <= backoff.max_delay);
        }
    }
}

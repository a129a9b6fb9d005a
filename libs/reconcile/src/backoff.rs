//! Backoff policies for restart attempts.

use std::time::Duration;

use rand::Rng;

/// Delay schedule applied between successive attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// The same delay every time.
    Constant { interval: Duration },

    /// Delay grows by `multiplier` per attempt, capped at `max`.
    Exponential {
        /// Delay for the first attempt.
        initial: Duration,
        /// Maximum delay.
        max: Duration,
        /// Growth factor per attempt.
        multiplier: f64,
        /// Jitter factor (0.0 to 1.0).
        jitter: f64,
    },
}

impl Default for BackoffPolicy {
    /// 30s initial, 10min max, multiplier 3, no jitter.
    fn default() -> Self {
        Self::Exponential {
            initial: Duration::from_secs(30),
            max: Duration::from_secs(10 * 60),
            multiplier: 3.0,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Constant-interval policy.
    pub fn constant(interval: Duration) -> Self {
        Self::Constant { interval }
    }

    /// Exponential policy without jitter.
    pub fn exponential(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self::Exponential {
            initial,
            max,
            multiplier,
            jitter: 0.0,
        }
    }

    /// Returns a copy of this policy with the given jitter factor.
    ///
    /// Has no effect on constant policies.
    pub fn with_jitter(self, factor: f64) -> Self {
        match self {
            Self::Exponential {
                initial,
                max,
                multiplier,
                ..
            } => Self::Exponential {
                initial,
                max,
                multiplier,
                jitter: factor.clamp(0.0, 1.0),
            },
            constant => constant,
        }
    }

    /// Calculate the delay for the given zero-based attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant { interval } => *interval,
            Self::Exponential {
                initial,
                max,
                multiplier,
                jitter,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let delay = initial.as_secs_f64() * multiplier.max(1.0).powi(exponent);
                let delay = delay.min(max.as_secs_f64());

                let jitter_range = delay * jitter;
                let delay = if jitter_range > 0.0 {
                    delay + rand::rng().random_range(-jitter_range..=jitter_range)
                } else {
                    delay
                };

                Duration::from_secs_f64(delay.max(0.0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 30)]
    #[case(1, 90)]
    #[case(2, 270)]
    #[case(3, 600)]
    #[case(40, 600)]
    fn test_default_policy_schedule(#[case] attempt: u32, #[case] secs: u64) {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(attempt), Duration::from_secs(secs));
    }

    #[test]
    fn test_constant_policy() {
        let policy = BackoffPolicy::constant(Duration::from_secs(5));
        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.delay(7), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = BackoffPolicy::exponential(
            Duration::from_secs(10),
            Duration::from_secs(60),
            2.0,
        )
        .with_jitter(0.25);

        for _ in 0..100 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_secs(15));
            assert!(d <= Duration::from_secs(25));
        }
    }

    #[test]
    fn test_multiplier_below_one_is_flat() {
        let policy =
            BackoffPolicy::exponential(Duration::from_secs(4), Duration::from_secs(60), 0.5);
        assert_eq!(policy.delay(3), Duration::from_secs(4));
    }
}

use std::time::Duration;

/// Delay schedule between failed acquisition attempts.
///
/// The lock polls with a [`Constant`](Self::Constant) interval unless told
/// otherwise. Other schedules only change how long a contended `acquire`
/// sleeps; they never change when it succeeds or fails.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// The same delay after every contended attempt.
    Constant {
        /// Poll interval.
        delay: Duration,
    },
    /// `delay * (attempt + 1)`, clamped to `max`.
    Linear {
        /// Per-attempt increment.
        delay: Duration,
        /// Upper bound on the computed delay.
        max: Duration,
    },
    /// `base * multiplier^attempt`, clamped to `max`.
    Exponential {
        /// Delay after the first contended attempt.
        base: Duration,
        /// Upper bound on the computed delay.
        max: Duration,
        /// Factor applied on each successive attempt.
        multiplier: f64,
        /// Spread waiters by a deterministic +0% to +40% so handles that
        /// collided once do not keep colliding.
        jitter: bool,
    },
}

impl RetryStrategy {
    /// Fixed poll interval.
    #[must_use]
    pub fn constant(delay: Duration) -> Self {
        Self::Constant { delay }
    }

    /// Delay to sleep after the zero-based contended `attempt`.
    ///
    /// ```
    /// use std::time::Duration;
    /// use keylock::RetryStrategy;
    ///
    /// let poll = RetryStrategy::constant(Duration::from_millis(10));
    /// assert_eq!(poll.delay_for(0), Duration::from_millis(10));
    /// assert_eq!(poll.delay_for(1_000), Duration::from_millis(10));
    /// ```
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant { delay } => *delay,
            Self::Linear { delay, max } => delay.saturating_mul(attempt.saturating_add(1)).min(*max),
            Self::Exponential {
                base,
                max,
                multiplier,
                jitter,
            } => {
                // Contended loops can run for a long time; cap the exponent so
                // the float never overflows before clamping.
                let exponent = i32::try_from(attempt.min(64)).unwrap_or(64);
                let mut secs = base.as_secs_f64() * multiplier.powi(exponent);
                if *jitter {
                    secs *= 1.0 + 0.1 * f64::from(attempt % 5);
                }
                Duration::try_from_secs_f64(secs.min(max.as_secs_f64())).unwrap_or(*max)
            }
        }
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Constant {
            delay: Duration::from_millis(100),
        }
    }
}

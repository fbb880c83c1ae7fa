//! Backoff calculation for the retry manager.

use std::time::Duration;

/// Delay strategy between retry attempts. `attempt` is 1-indexed.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between retries.
    Constant { delay: Duration },
    /// `base * multiplier^(attempt - 1)`, capped at `max` when set.
    Exponential { base: Duration, multiplier: f64, max: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn exponential(base: Duration, multiplier: f64) -> Self {
        Backoff::Exponential { base, multiplier, max: None }
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        if let Backoff::Exponential { max: ref mut m, .. } = self {
            *m = Some(max);
        }
        self
    }

    /// Delay before the given attempt (1-indexed: the delay preceding attempt 2 is `delay(1)`).
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Exponential { base, multiplier, max } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let factor = multiplier.max(1.0).powi(exponent);
                let scaled_nanos = (base.as_nanos() as f64) * factor;
                let exp_delay = if scaled_nanos.is_finite() && scaled_nanos <= u64::MAX as f64 {
                    Duration::from_nanos(scaled_nanos as u64)
                } else {
                    Duration::from_secs(u64::MAX)
                };

                match max {
                    Some(max) => exp_delay.min(*max),
                    None => exp_delay,
                }
            }
        }
    }
}

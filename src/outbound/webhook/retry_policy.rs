use std::time::Duration;

/// Exponential backoff for failed webhook deliveries.
///
/// After failed attempt `n` the next attempt waits `base * 2^(n-1)`, capped
/// at `max_delay`. With the default one-minute base that is 1, 2, 4, 8, 16…
/// minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,

    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(24 * 60 * 60))
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay to wait after failed attempt `attempt_number` (1-based).
    pub fn next_delay(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1);
        let multiplier = 2_u32.checked_pow(exponent).unwrap_or(u32::MAX);

        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(Duration::MAX)
            .min(self.max_delay)
    }

    /// Whether `attempt_number` was the last allowed attempt.
    pub fn is_exhausted(&self, attempt_number: u32, max_attempts: u32) -> bool {
        attempt_number >= max_attempts
    }
}

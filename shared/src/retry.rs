// Reconnect policy for the station-mode client.

/// Exponential backoff with a delay ceiling and an optional attempt cap.
///
/// The default keeps the firmware's historical behavior of retrying the
/// attach indefinitely, but with the delay capped instead of hammering the
/// access point at a fixed rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            max_delay_ms: 60_000,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Whether a retry numbered `attempt` (0-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }

    /// Delay before retry `attempt` (0-based): initial << attempt, capped.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64 << attempt.min(20);
        self.initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_the_ceiling() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_ms(0), 2_000);
        assert_eq!(policy.delay_ms(1), 4_000);
        assert_eq!(policy.delay_ms(2), 8_000);
        assert_eq!(policy.delay_ms(10), 60_000);
        // no overflow for absurd attempt counts
        assert_eq!(policy.delay_ms(u32::MAX), 60_000);
    }

    #[test]
    fn unbounded_policy_always_allows() {
        let policy = RetryPolicy::default();
        assert!(policy.allows(0));
        assert!(policy.allows(1_000_000));
    }

    #[test]
    fn bounded_policy_stops_at_the_cap() {
        let policy = RetryPolicy { max_attempts: Some(3), ..RetryPolicy::default() };
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }
}

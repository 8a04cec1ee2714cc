use std::time::Duration;

/// Delay before retry number `attempt` (0-based): `initial * 2^attempt`,
/// capped at `max`.
pub fn next_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.min(31);
    initial.checked_mul(factor).unwrap_or(max).min(max)
}

/// Upload retry pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first retryable failure.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        next_delay(attempt, self.initial_delay, self.max_delay)
    }

    /// Starts a fresh sequence for one artifact.
    pub fn start(&self) -> BackoffState {
        BackoffState {
            policy: *self,
            attempt: 0,
        }
    }
}

/// Position in one artifact's retry sequence.
#[derive(Debug, Clone)]
pub struct BackoffState {
    policy: BackoffPolicy,
    /// Retries scheduled so far.
    attempt: u32,
}

impl BackoffState {
    /// Returns the delay before the next retry and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn first_delay_is_initial() {
        assert_eq!(next_delay(0, 500 * MS, 60_000 * MS), 500 * MS);
    }

    #[test]
    fn doubles_then_caps() {
        let initial = 250 * MS;
        let max = 5_000 * MS;
        let delays: Vec<_> = (0..8).map(|a| next_delay(a, initial, max)).collect();
        assert_eq!(
            delays,
            [250, 500, 1000, 2000, 4000, 5000, 5000, 5000].map(|n| n * MS)
        );
    }

    #[test]
    fn monotonic_and_bounded_for_large_attempts() {
        let initial = Duration::from_secs(3);
        let max = Duration::from_secs(3600);
        let mut prev = Duration::ZERO;
        for attempt in 0..200 {
            let d = next_delay(attempt, initial, max);
            assert!(d >= prev, "attempt {attempt}: {d:?} < {prev:?}");
            assert!(d <= max);
            prev = d;
        }
        assert_eq!(next_delay(u32::MAX, initial, max), max);
    }

    #[test]
    fn state_walks_the_sequence() {
        let mut state = BackoffPolicy::new(100 * MS, 300 * MS).start();
        assert_eq!(state.next_delay(), 100 * MS);
        assert_eq!(state.next_delay(), 200 * MS);
        assert_eq!(state.next_delay(), 300 * MS);
        assert_eq!(state.next_delay(), 300 * MS);
        assert_eq!(state.attempt, 4);
    }

    #[test]
    fn default_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), 500 * MS);
        assert_eq!(policy.delay_for(30), Duration::from_secs(60));
    }
}

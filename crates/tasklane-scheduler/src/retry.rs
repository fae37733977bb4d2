//! Retry scheduling and exponential backoff.

use std::time::Duration;

use crate::tasks::Task;

/// `base × 2^(retry_count − 1)`, saturating, capped at `cap`.
///
/// `retry_count` is the post-increment count, so the first retry waits `base`.
pub fn backoff_delay(base: Duration, retry_count: u32, cap: Duration) -> Duration {
    let exponent = retry_count.saturating_sub(1);
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// The retry the budget still allows after a failure, as the new
/// `retry_count` and the delay before it. `None` once `max_retries` is spent.
///
/// Shared by automatic and manual retry.
pub fn next_retry(task: &Task, cap: Duration) -> Option<(u32, Duration)> {
    if task.retry_count >= task.max_retries {
        return None;
    }
    let retry_count = task.retry_count + 1;
    Some((
        retry_count,
        backoff_delay(task.retry_delay_base, retry_count, cap),
    ))
}

/// Pause policy for the coordinating loop after faulty ticks.
///
/// Each consecutive fault doubles the pause up to `cap`; the first clean
/// tick resets the streak.
#[derive(Debug, Clone)]
pub struct FaultBackoff {
    base: Duration,
    cap: Duration,
    faults: u32,
}

impl FaultBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            faults: 0,
        }
    }

    /// Consecutive faulty ticks so far.
    pub fn faults(&self) -> u32 {
        self.faults
    }

    pub fn is_faulting(&self) -> bool {
        self.faults > 0
    }

    /// Record a faulty tick and return how long to pause before the next one.
    pub fn on_fault(&mut self) -> Duration {
        self.faults = self.faults.saturating_add(1);
        backoff_delay(self.base, self.faults, self.cap)
    }

    /// Record a clean tick. Returns the length of the streak it ended, if any.
    pub fn on_clean(&mut self) -> Option<u32> {
        match std::mem::take(&mut self.faults) {
            0 => None,
            streak => Some(streak),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_exponential_sequence() {
        let base = Duration::from_secs(60);
        let delays: Vec<u64> = (1..=4)
            .map(|n| backoff_delay(base, n, HOUR).as_secs())
            .collect();
        assert_eq!(delays, vec![60, 120, 240, 480]);
    }

    #[test]
    fn test_delay_is_capped() {
        let base = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, 10, HOUR), HOUR);
        assert_eq!(backoff_delay(base, 200, HOUR), HOUR);
    }

    #[test]
    fn test_zero_count_waits_base() {
        assert_eq!(
            backoff_delay(Duration::from_secs(5), 0, HOUR),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_fault_pause_grows_then_caps() {
        let mut backoff = FaultBackoff::new(Duration::from_secs(5), Duration::from_secs(60));
        let pauses: Vec<u64> = (0..7).map(|_| backoff.on_fault().as_secs()).collect();
        assert_eq!(pauses, vec![5, 10, 20, 40, 60, 60, 60]);
        assert_eq!(backoff.faults(), 7);
        assert!(backoff.is_faulting());
    }

    #[test]
    fn test_clean_tick_resets_fault_streak() {
        let mut backoff = FaultBackoff::new(Duration::from_secs(5), Duration::from_secs(60));
        assert_eq!(backoff.on_clean(), None);

        backoff.on_fault();
        backoff.on_fault();
        backoff.on_fault();
        assert_eq!(backoff.on_clean(), Some(3));
        assert!(!backoff.is_faulting());
        assert_eq!(backoff.on_clean(), None);

        assert_eq!(backoff.on_fault(), Duration::from_secs(5));
    }
}

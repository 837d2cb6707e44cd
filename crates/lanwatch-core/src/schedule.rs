//! Scan back-off schedule
//!
//! Intervals start at `min`, double after every scan and stay at `max` once
//! reached. The schedule only resets when a new one is created.

use std::time::Duration;

pub const DEFAULT_PROBE_INTERVAL_MIN: Duration = Duration::from_secs(5);
pub const DEFAULT_PROBE_INTERVAL_MAX: Duration = Duration::from_secs(45);

#[derive(Debug, Clone)]
pub struct ScanSchedule {
    min: Duration,
    max: Duration,
    last: Option<Duration>,
}

impl Default for ScanSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_INTERVAL_MIN, DEFAULT_PROBE_INTERVAL_MAX)
    }
}

impl ScanSchedule {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            last: None,
        }
    }

    /// Interval to wait after the scan that just ran
    pub fn next_interval(&mut self) -> Duration {
        let next = match self.last {
            None => self.min,
            Some(last) => last.saturating_mul(2).min(self.max),
        };
        self.last = Some(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let mut schedule = ScanSchedule::default();
        let observed: Vec<u64> = (0..8).map(|_| schedule.next_interval().as_secs()).collect();
        assert_eq!(observed, vec![5, 10, 20, 40, 45, 45, 45, 45]);
    }

    #[test]
    fn test_never_exceeds_max() {
        let mut schedule = ScanSchedule::new(Duration::from_millis(300), Duration::from_secs(1));
        let mut prev = Duration::ZERO;
        for _ in 0..100 {
            let next = schedule.next_interval();
            assert!(next <= Duration::from_secs(1));
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn test_max_below_min_is_clamped() {
        let mut schedule = ScanSchedule::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(schedule.next_interval(), Duration::from_secs(10));
        assert_eq!(schedule.next_interval(), Duration::from_secs(10));
    }
}

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

/// Outcome of evaluating one launch attempt against the restart history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Launch may proceed; the attempt has been recorded.
    Admit,
    /// Restart intensity exceeded; the attempt is not recorded.
    Deny,
}

/// Keep the timestamps that satisfy `now - ts < size`, preserving order.
///
/// Entries equal to `now` (or in the future) are always kept.
pub fn window(
    restarts: &[DateTime<Utc>],
    now: DateTime<Utc>,
    size: TimeDelta,
) -> Vec<DateTime<Utc>> {
    restarts
        .iter()
        .copied()
        .filter(|ts| now.signed_duration_since(*ts) < size)
        .collect()
}

/// Sliding-window restart limiter.
///
/// Admits at most `max_restarts` launches per trailing `window`. Only admitted
/// launches are recorded, so a service that is permanently denied does not
/// keep growing its history.
#[derive(Debug, Clone, Copy)]
pub struct RestartLimiter {
    window: TimeDelta,
    max_restarts: u32,
}

impl RestartLimiter {
    pub fn new(window: TimeDelta, max_restarts: u32) -> Self {
        Self {
            window,
            max_restarts,
        }
    }

    /// Evaluate against the current wall clock.
    pub fn evaluate(&self, restarts: &[DateTime<Utc>]) -> (Decision, Vec<DateTime<Utc>>) {
        self.evaluate_at(restarts, Utc::now())
    }

    /// Evaluate with a single reference instant.
    ///
    /// The returned history is always the pruned one; on `Admit` it also
    /// carries `now`.
    pub fn evaluate_at(
        &self,
        restarts: &[DateTime<Utc>],
        now: DateTime<Utc>,
    ) -> (Decision, Vec<DateTime<Utc>>) {
        let mut pruned = window(restarts, now, self.window);
        let recent = pruned.len();
        debug!(
            recorded = restarts.len(),
            recent,
            max_restarts = self.max_restarts,
            window_secs = self.window.num_seconds(),
            "evaluated restart window"
        );

        if recent >= self.max_restarts as usize {
            return (Decision::Deny, pruned);
        }

        pruned.push(now);
        (Decision::Admit, pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MAX_RESTARTS: u32 = 5;

    fn test_window() -> TimeDelta {
        TimeDelta::seconds(600)
    }

    /// `count` restarts aged `exp^1 .. exp^count` seconds before `now`,
    /// truncated to whole seconds.
    fn make_window(now: DateTime<Utc>, count: u32, exp: i64) -> Vec<DateTime<Utc>> {
        (1..=count)
            .map(|i| {
                DateTime::from_timestamp(now.timestamp() - exp.pow(i), 0)
                    .expect("timestamp in range")
            })
            .collect()
    }

    #[test]
    fn test_window_exponential_ages() {
        let now = Utc::now();
        let w = make_window(now, 5, 5);
        // 5s, 25s and 125s ago are inside; 625s and 3125s are not.
        assert_eq!(window(&w, now, test_window()).len(), 3);
    }

    #[test]
    fn test_window_preserves_order_and_input() {
        let now = Utc::now();
        let old = now - TimeDelta::seconds(700);
        let a = now - TimeDelta::seconds(30);
        let b = now - TimeDelta::seconds(10);
        let input = vec![a, old, b, old];
        let pruned = window(&input, now, test_window());
        assert_eq!(pruned, vec![a, b]);
        assert_eq!(input.len(), 4);
    }

    #[test]
    fn test_window_is_idempotent() {
        let now = Utc::now();
        let w = make_window(now, 5, 4);
        let once = window(&w, now, test_window());
        let twice = window(&once, now, test_window());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_window_empty() {
        assert!(window(&[], Utc::now(), test_window()).is_empty());
    }

    #[test]
    fn test_window_boundary_is_exclusive() {
        let now = Utc::now();
        let edge = now - test_window();
        let inside = now - test_window() + TimeDelta::nanoseconds(1);
        let pruned = window(&[edge, inside, now], now, test_window());
        assert_eq!(pruned, vec![inside, now]);
    }

    #[test]
    fn test_limit_denies_at_threshold_without_recording() {
        let now = Utc::now();
        let limiter = RestartLimiter::new(test_window(), TEST_MAX_RESTARTS);
        // Ages 2, 4, 8, 16, 32 seconds: all five inside the window.
        let w = make_window(now, 5, 2);
        let (decision, updated) = limiter.evaluate_at(&w, now);
        assert_eq!(decision, Decision::Deny);
        assert_eq!(updated.len(), w.len());
    }

    #[test]
    fn test_limit_deny_returns_pruned_history() {
        let now = Utc::now();
        let limiter = RestartLimiter::new(test_window(), 2);
        let mut w = make_window(now, 3, 2);
        w.insert(0, now - TimeDelta::hours(2));
        let (decision, updated) = limiter.evaluate_at(&w, now);
        assert_eq!(decision, Decision::Deny);
        assert_eq!(updated.len(), 3);
    }

    #[test]
    fn test_limit_admits_below_threshold_and_records() {
        let now = Utc::now();
        let limiter = RestartLimiter::new(test_window(), TEST_MAX_RESTARTS);
        let w = make_window(now, 5, 5);
        let (decision, updated) = limiter.evaluate_at(&w, now);
        assert_eq!(decision, Decision::Admit);
        assert_eq!(updated.len(), 4);
        assert_eq!(updated.last(), Some(&now));
    }

    #[test]
    fn test_limit_sequence_trips_on_sixth_attempt() {
        let limiter = RestartLimiter::new(test_window(), TEST_MAX_RESTARTS);
        let start = Utc::now();
        let mut history: Vec<DateTime<Utc>> = Vec::new();
        for i in 0..5 {
            let (decision, updated) = limiter.evaluate_at(&history, start + TimeDelta::seconds(i));
            assert_eq!(decision, Decision::Admit, "attempt {}", i + 1);
            history = updated;
        }
        let (decision, updated) = limiter.evaluate_at(&history, start + TimeDelta::seconds(5));
        assert_eq!(decision, Decision::Deny);
        assert_eq!(updated.len(), 5);
    }

    #[test]
    fn test_limit_recovers_after_window_passes() {
        let limiter = RestartLimiter::new(test_window(), 1);
        let start = Utc::now();
        let (_, history) = limiter.evaluate_at(&[], start);
        let (decision, _) = limiter.evaluate_at(&history, start + TimeDelta::seconds(599));
        assert_eq!(decision, Decision::Deny);
        let (decision, updated) = limiter.evaluate_at(&history, start + TimeDelta::seconds(600));
        assert_eq!(decision, Decision::Admit);
        assert_eq!(updated.len(), 1);
    }
}

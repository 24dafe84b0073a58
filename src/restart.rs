//! Shared crash-isolation primitives for supervised tasks (C6, spec §4.6/§7).
//!
//! Each supervised unit restarts in place after a crash, waits
//! `RESTART_DELAY` before trying again, and gives up once it has failed more
//! than `MAX_FAILURES_IN_WINDOW` times within `FAILURE_WINDOW` — spec §4.6:
//! "restarted with 1 s delay, up to 10 consecutive failures before the
//! process exits", and §7's `TaskCrash` row: "restart task (up to 10 times
//! within 60 s), then exit 3." The budget is tracked per unit, not globally,
//! so one noisy task cannot exhaust another's restart budget.

use std::any::Any;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const RESTART_DELAY: Duration = Duration::from_secs(1);
pub const FAILURE_WINDOW: Duration = Duration::from_secs(60);
pub const MAX_FAILURES_IN_WINDOW: usize = 10;

/// Sliding-window crash counter for one supervised unit.
pub struct FailureTracker {
    recent: VecDeque<Instant>,
}

impl FailureTracker {
    pub fn new() -> Self {
        FailureTracker {
            recent: VecDeque::new(),
        }
    }

    /// Record a failure now. Returns `true` if the unit is still within its
    /// restart budget and should be retried, `false` once it has exceeded
    /// `MAX_FAILURES_IN_WINDOW` failures within `FAILURE_WINDOW`.
    pub fn record_and_check_budget(&mut self) -> bool {
        let now = Instant::now();
        self.recent.push_back(now);
        while self
            .recent
            .front()
            .is_some_and(|t| now.duration_since(*t) > FAILURE_WINDOW)
        {
            self.recent.pop_front();
        }
        self.recent.len() <= MAX_FAILURES_IN_WINDOW
    }
}

/// Best-effort extraction of a human-readable message from a caught panic
/// payload, for log lines.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_allows_up_to_the_limit() {
        let mut tracker = FailureTracker::new();
        for _ in 0..MAX_FAILURES_IN_WINDOW {
            assert!(tracker.record_and_check_budget());
        }
        assert!(!tracker.record_and_check_budget());
    }
}

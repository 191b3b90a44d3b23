//! Health-check scheduling policy
//!
//! The polling cadence adapts to what the grill is doing: a panicking
//! controller polls hard looking for recovery, a preheating grill polls
//! at double rate so the at-temp flip lands promptly, and an idle grill
//! backs off to one poll every few minutes. The policy functions here are
//! pure; the controller owns the actual timer task.

use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::config::{
    Preferences, ACTIVE_MULTIPLIER, INACTIVE_MULTIPLIER, MAX_HEALTH_CHECK_INTERVAL,
    MAX_HEALTH_INTERVAL_HOURS, MIN_HEALTH_CHECK_INTERVAL, PANIC_RECOVERY_MULTIPLIER,
    PREHEATING_MULTIPLIER,
};

/// Snapshot of the state bits the interval policy cares about.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalInputs {
    pub panic: bool,
    pub grill_on: bool,
    pub preheating: bool,
}

/// Handle to the single armed health-check timer of a device.
///
/// Exactly one token may be live per device; cancelling it guarantees the
/// scheduled handler will not run.
#[derive(Debug)]
pub struct TimerToken {
    pub id: u64,
    pub scheduled_at: Instant,
    handle: JoinHandle<()>,
}

impl TimerToken {
    pub fn new(id: u64, scheduled_at: Instant, handle: JoinHandle<()>) -> Self {
        Self { id, scheduled_at, handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

/// Next health-check interval for the given state.
pub fn compute_interval(prefs: &Preferences, inputs: &IntervalInputs) -> Duration {
    let base = prefs.refresh_interval().as_secs_f64();
    let multiplier = if inputs.panic {
        PANIC_RECOVERY_MULTIPLIER
    } else if inputs.grill_on && inputs.preheating {
        PREHEATING_MULTIPLIER
    } else if inputs.grill_on {
        ACTIVE_MULTIPLIER
    } else {
        INACTIVE_MULTIPLIER
    };
    let secs = (base * multiplier)
        .max(MIN_HEALTH_CHECK_INTERVAL.as_secs_f64())
        .min(MAX_HEALTH_CHECK_INTERVAL.as_secs_f64())
        .min(MAX_HEALTH_INTERVAL_HOURS.as_secs_f64());
    Duration::from_secs_f64(secs)
}

/// Interval for the single tick right after setup.
pub fn first_tick_interval(prefs: &Preferences) -> Duration {
    prefs.refresh_interval().max(MIN_HEALTH_CHECK_INTERVAL)
}

/// Backoff for the n-th timer-recovery attempt (1-based), capped.
pub fn recovery_backoff(attempt: u32) -> Duration {
    let backoff = MIN_HEALTH_CHECK_INTERVAL * attempt.max(1);
    backoff.min(MAX_HEALTH_CHECK_INTERVAL)
}

/// A recorded timer older than the slowest legal cadence is dead.
pub fn is_timer_stale(elapsed_since_scheduled: Duration) -> bool {
    let horizon = MAX_HEALTH_CHECK_INTERVAL.as_secs_f64() * INACTIVE_MULTIPLIER;
    elapsed_since_scheduled.as_secs_f64() > horizon
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefs_with_interval(secs: u64) -> Preferences {
        Preferences {
            refresh_interval: secs,
            ..Default::default()
        }
    }

    #[test]
    fn multiplier_precedence() {
        let prefs = prefs_with_interval(60);
        let on = IntervalInputs { grill_on: true, ..Default::default() };
        let preheating = IntervalInputs { grill_on: true, preheating: true, ..Default::default() };
        let panicking = IntervalInputs { panic: true, grill_on: true, preheating: true };
        let idle = IntervalInputs::default();

        assert_eq!(compute_interval(&prefs, &on), Duration::from_secs(60));
        assert_eq!(compute_interval(&prefs, &preheating), Duration::from_secs(30));
        // Panic outranks everything, 0.3x clamped to the floor.
        assert_eq!(compute_interval(&prefs, &panicking), Duration::from_secs(18));
        assert_eq!(compute_interval(&prefs, &idle), Duration::from_secs(300));
    }

    #[test]
    fn interval_always_inside_the_legal_window() {
        // Sweep of preference values and state combinations.
        for base in [0, 1, 15, 30, 60, 300, 3600, 86_400] {
            let prefs = prefs_with_interval(base);
            for panic in [false, true] {
                for grill_on in [false, true] {
                    for preheating in [false, true] {
                        let inputs = IntervalInputs { panic, grill_on, preheating };
                        let interval = compute_interval(&prefs, &inputs);
                        assert!(interval >= MIN_HEALTH_CHECK_INTERVAL, "base {}", base);
                        assert!(interval <= MAX_HEALTH_CHECK_INTERVAL, "base {}", base);
                        assert!(interval <= MAX_HEALTH_INTERVAL_HOURS, "base {}", base);
                    }
                }
            }
        }
    }

    #[test]
    fn panic_recovery_polls_faster_than_steady_state() {
        let prefs = prefs_with_interval(30);
        let steady = compute_interval(&prefs, &IntervalInputs { grill_on: true, ..Default::default() });
        let panicking = compute_interval(&prefs, &IntervalInputs { panic: true, grill_on: true, preheating: false });
        assert!(panicking < steady);
        // 30s * 0.3 = 9s clamps up to the floor.
        assert_eq!(panicking, MIN_HEALTH_CHECK_INTERVAL);
    }

    #[test]
    fn first_tick_uses_at_least_the_floor() {
        assert_eq!(first_tick_interval(&prefs_with_interval(5)), MIN_HEALTH_CHECK_INTERVAL);
        assert_eq!(first_tick_interval(&prefs_with_interval(45)), Duration::from_secs(45));
    }

    #[test]
    fn recovery_backoff_scales_and_caps() {
        assert_eq!(recovery_backoff(1), Duration::from_secs(15));
        assert_eq!(recovery_backoff(2), Duration::from_secs(30));
        assert_eq!(recovery_backoff(3), Duration::from_secs(45));
        assert_eq!(recovery_backoff(100), MAX_HEALTH_CHECK_INTERVAL);
        assert_eq!(recovery_backoff(0), Duration::from_secs(15));
    }

    #[test]
    fn staleness_horizon() {
        assert!(!is_timer_stale(Duration::from_secs(1799)));
        assert!(is_timer_stale(Duration::from_secs(1801)));
    }
}

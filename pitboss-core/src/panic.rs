//! Panic-state arbitration
//!
//! "Panic" flags the one situation worth waking somebody for: a grill that
//! was cooking recently and has stopped answering. A grill that has been
//! silent longer than [`PANIC_TIMEOUT`] was plausibly turned off at the
//! wall, so panic releases rather than latching forever.

use std::time::Instant;

use crate::config::PANIC_TIMEOUT;
use crate::state::{SessionMemory, StatusMessage};

/// Consecutive auth failures tolerated before acting.
pub const AUTH_FAILURE_THRESHOLD: u32 = 2;

/// Outcome of auth-failure arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthArbitration {
    /// Below the failure threshold; callers keep the previous state.
    Grace,
    /// Threshold crossed; the device is considered offline.
    Failing { panic: bool },
}

/// A decoded status arrived; all failure tracking resets.
pub fn update_on_success(mem: &mut SessionMemory) {
    mem.panic_state = false;
    mem.consecutive_auth_failures = 0;
    mem.first_offline_time = None;
}

/// The poll failed at the transport level. Returns the panic state.
pub fn update_on_offline(mem: &mut SessionMemory, now: Instant) -> bool {
    match mem.last_active_time {
        Some(active) if now.duration_since(active) <= PANIC_TIMEOUT => {
            mem.panic_state = true;
        }
        Some(_) => {
            // Silent past the window: assume a deliberate shutdown.
            mem.panic_state = false;
        }
        None => {}
    }
    mem.panic_state
}

/// Both tokens were rejected. Two strikes before the state machine moves;
/// a grill that was last seen on escalates to panic, one that was off
/// merely goes offline.
pub fn update_on_auth_failure(
    mem: &mut SessionMemory,
    now: Instant,
    grill_on: bool,
) -> AuthArbitration {
    mem.consecutive_auth_failures = mem.consecutive_auth_failures.saturating_add(1);
    if mem.consecutive_auth_failures < AUTH_FAILURE_THRESHOLD {
        return AuthArbitration::Grace;
    }
    if mem.first_offline_time.is_none() {
        mem.first_offline_time = Some(now);
    }
    if grill_on {
        mem.panic_state = true;
    }
    AuthArbitration::Failing { panic: mem.panic_state }
}

/// Highest-priority message while the panic state holds.
pub fn panic_message() -> StatusMessage {
    StatusMessage::PanicLostConnection
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn active_mem(at: Instant) -> SessionMemory {
        SessionMemory {
            last_active_time: Some(at),
            last_grill_on: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn recent_activity_plus_silence_panics() {
        let t0 = Instant::now();
        let mut mem = active_mem(t0);
        assert!(update_on_offline(&mut mem, t0 + Duration::from_secs(60)));
        assert!(mem.panic_state);
    }

    #[test]
    fn long_silence_releases_panic() {
        let t0 = Instant::now();
        let mut mem = active_mem(t0);
        mem.panic_state = true;
        let now = t0 + PANIC_TIMEOUT + Duration::from_secs(1);
        assert!(!update_on_offline(&mut mem, now));
        assert!(!mem.panic_state);
    }

    #[test]
    fn never_active_never_panics() {
        let now = Instant::now();
        let mut mem = SessionMemory::default();
        assert!(!update_on_offline(&mut mem, now));
    }

    #[test]
    fn boundary_inside_window_panics() {
        let t0 = Instant::now();
        let mut mem = active_mem(t0);
        assert!(update_on_offline(&mut mem, t0 + PANIC_TIMEOUT));
    }

    #[test]
    fn success_clears_all_failure_tracking() {
        let now = Instant::now();
        let mut mem = active_mem(now);
        mem.panic_state = true;
        mem.consecutive_auth_failures = 5;
        mem.first_offline_time = Some(now);
        update_on_success(&mut mem);
        assert!(!mem.panic_state);
        assert_eq!(mem.consecutive_auth_failures, 0);
        assert_eq!(mem.first_offline_time, None);
    }

    #[test]
    fn single_auth_failure_is_grace() {
        let now = Instant::now();
        let mut mem = SessionMemory::default();
        assert_eq!(
            update_on_auth_failure(&mut mem, now, true),
            AuthArbitration::Grace
        );
        assert!(!mem.panic_state);
        assert_eq!(mem.consecutive_auth_failures, 1);
    }

    #[test]
    fn second_auth_failure_with_grill_on_panics() {
        let now = Instant::now();
        let mut mem = SessionMemory::default();
        update_on_auth_failure(&mut mem, now, true);
        let outcome = update_on_auth_failure(&mut mem, now, true);
        assert_eq!(outcome, AuthArbitration::Failing { panic: true });
        assert!(mem.first_offline_time.is_some());
    }

    #[test]
    fn second_auth_failure_with_grill_off_stays_calm() {
        let now = Instant::now();
        let mut mem = SessionMemory::default();
        update_on_auth_failure(&mut mem, now, false);
        let outcome = update_on_auth_failure(&mut mem, now, false);
        assert_eq!(outcome, AuthArbitration::Failing { panic: false });
        assert!(!mem.panic_state);
    }
}

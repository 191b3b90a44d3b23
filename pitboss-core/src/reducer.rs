//! Pure reduction of polled status into derived operational state
//!
//! One function folds each poll result (or its absence) into the state the
//! host sees, updating session memory as it goes. Nothing here touches the
//! network or the clock; `now` is an argument, which is what keeps the
//! cook-session rules testable.

use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{self, power, STARTUP_GRACE_PERIOD, TEMP_TOLERANCE_PERCENT};
use crate::panic;
use crate::state::{
    Connectivity, DerivedState, Operation, ReduceInput, SessionMemory, StatusMessage,
};
use crate::status::Status;

/// How long a stale chamber reading may stand in for a failed one.
const MAIN_TEMP_CACHE_MAX_AGE: Duration = Duration::from_secs(STARTUP_GRACE_PERIOD.as_secs() * 2);

/// Fold one poll into the next derived state.
pub fn reduce(
    prev: &DerivedState,
    mem: &mut SessionMemory,
    _prefs: &config::Preferences,
    input: ReduceInput,
    now: Instant,
) -> DerivedState {
    match input {
        ReduceInput::Fresh(status) => reduce_fresh(mem, status, now),
        ReduceInput::Offline => reduce_offline(prev, mem, now),
        ReduceInput::AuthFail { grill_on } => reduce_auth_fail(prev, mem, grill_on, now),
    }
}

fn reduce_fresh(mem: &mut SessionMemory, status: Status, now: Instant) -> DerivedState {
    let prev_success = mem.last_successful_check;
    let grill_on = status.grill_on();
    let was_on = mem.last_grill_on.unwrap_or(false);
    let target = status.set_temp.degrees().filter(|&t| t > 0);

    // A new setpoint starts a fresh climb within the same session.
    if let Some(t) = target {
        if mem.last_target_temp.is_some() && mem.last_target_temp != Some(t) {
            debug!(old = ?mem.last_target_temp, new = t, "target changed, clearing cycle tracking");
            mem.session_reached_temp = false;
        }
        mem.last_target_temp = Some(t);
    }

    if grill_on && !was_on {
        // Rising edge. An existing target means this is a continuation of
        // a briefly interrupted session, so the rest of memory stands.
        mem.grill_start_time = Some(now);
        mem.session_reached_temp = false;
    } else if !grill_on && was_on {
        mem.grill_start_time = None;
        if target.is_none() {
            // Complete shutdown, not a power blip.
            mem.last_target_temp = None;
            mem.session_reached_temp = false;
            mem.session_ever_reached_temp = false;
        }
    }
    mem.last_grill_on = Some(grill_on);
    if grill_on {
        mem.last_active_time = Some(now);
    }

    // Resolve the chamber reading. A running grill with a failed reading
    // may lean on a recent cached value; an idle grill simply has none.
    let (current, using_cached) = match status.grill_temp.degrees() {
        Some(t) => {
            mem.last_valid_grill_temp = Some((t, now));
            (Some(t), false)
        }
        None if grill_on => match mem.last_valid_grill_temp {
            Some((t, at)) if now.duration_since(at) <= MAIN_TEMP_CACHE_MAX_AGE => (Some(t), true),
            _ => (None, false),
        },
        None => (None, false),
    };

    if let (Some(cur), Some(tgt)) = (current, mem.last_target_temp) {
        if cur as f64 >= TEMP_TOLERANCE_PERCENT * tgt as f64 {
            mem.session_reached_temp = true;
            mem.session_ever_reached_temp = true;
        }
    }

    let operation = if !grill_on {
        if status.fan_state {
            Operation::Cooling
        } else {
            Operation::Off
        }
    } else {
        match (mem.last_target_temp, current) {
            (Some(tgt), Some(cur)) => {
                if mem.session_reached_temp || cur as f64 >= TEMP_TOLERANCE_PERCENT * tgt as f64 {
                    Operation::AtTemp
                } else if mem.session_ever_reached_temp {
                    Operation::Heating
                } else {
                    Operation::Preheating
                }
            }
            (Some(_), None) => {
                if mem.session_ever_reached_temp {
                    Operation::Heating
                } else {
                    Operation::Preheating
                }
            }
            (None, _) => Operation::Off,
        }
    };

    let main_temp_failed = grill_on
        && !status.grill_temp.is_connected()
        && !using_cached
        && !within_startup_grace(mem, now)
        && !status.any_probe_connected()
        && prev_success.map_or(true, |at| now.duration_since(at) > MAIN_TEMP_CACHE_MAX_AGE);

    panic::update_on_success(mem);
    mem.last_successful_check = Some(now);

    let message = if let Some(label) = status.errors.first_label() {
        StatusMessage::HardwareError(label)
    } else if main_temp_failed {
        StatusMessage::MainTempError
    } else if using_cached {
        StatusMessage::UsingCachedStatus
    } else {
        operational_message(&status, operation)
    };

    DerivedState {
        connectivity: Connectivity::Online,
        operation,
        panic: false,
        message,
        power_w: estimate_power(&status, operation == Operation::Cooling),
        last_status: Some(status),
    }
}

fn reduce_offline(prev: &DerivedState, mem: &mut SessionMemory, now: Instant) -> DerivedState {
    if mem.first_offline_time.is_none() {
        mem.first_offline_time = Some(now);
    }
    let panicking = panic::update_on_offline(mem, now);
    DerivedState {
        connectivity: Connectivity::Offline,
        operation: Operation::Off,
        panic: panicking,
        message: if panicking {
            panic::panic_message()
        } else {
            StatusMessage::Disconnected
        },
        power_w: 0.0,
        last_status: prev.last_status.clone(),
    }
}

fn reduce_auth_fail(
    prev: &DerivedState,
    mem: &mut SessionMemory,
    grill_on: Option<bool>,
    now: Instant,
) -> DerivedState {
    let grill_on = grill_on.or(mem.last_grill_on).unwrap_or(false);
    match panic::update_on_auth_failure(mem, now, grill_on) {
        panic::AuthArbitration::Grace => prev.clone(),
        panic::AuthArbitration::Failing { panic } => DerivedState {
            connectivity: Connectivity::AuthFailing { grill_on },
            operation: prev.operation,
            panic,
            message: if grill_on {
                StatusMessage::AuthIssueGrillOn
            } else {
                StatusMessage::AuthIssueGrillOff
            },
            power_w: prev.power_w,
            last_status: prev.last_status.clone(),
        },
    }
}

fn within_startup_grace(mem: &SessionMemory, now: Instant) -> bool {
    mem.grill_start_time
        .map_or(false, |start| now.duration_since(start) <= STARTUP_GRACE_PERIOD)
}

fn operational_message(status: &Status, operation: Operation) -> StatusMessage {
    if status.prime_state {
        return StatusMessage::GrillPriming;
    }
    match operation {
        Operation::Cooling => StatusMessage::Cooling,
        Operation::Preheating => StatusMessage::Preheating,
        Operation::Heating => StatusMessage::Heating,
        Operation::AtTemp => StatusMessage::AtTemp,
        Operation::Off => StatusMessage::GrillOff,
    }
}

/// Component-based power estimate, watts.
///
/// The base controller draw is counted once; each active component adds
/// its nominal figure net of that base. The fan draws harder while
/// pulling the chamber down after a cook.
pub fn estimate_power(status: &Status, cooling: bool) -> f64 {
    let mut total = power::BASE_CONTROLLER;
    if status.motor_state {
        total += power::AUGER_MOTOR - power::BASE_CONTROLLER;
    }
    if status.hot_state {
        total += power::IGNITOR_HOT - power::BASE_CONTROLLER;
    }
    if status.fan_state {
        let fan = if cooling {
            power::FAN_HIGH_COOLING
        } else {
            power::FAN_LOW_OPERATION
        };
        total += fan - power::BASE_CONTROLLER;
    }
    if status.light_state {
        total += power::LIGHT_ON - power::BASE_CONTROLLER;
    }
    if status.prime_state {
        total += power::PRIME_ON - power::BASE_CONTROLLER;
    }
    total.max(0.0)
}

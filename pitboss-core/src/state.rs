//! Derived state, session memory, and the user-visible message enum
//!
//! The scattered per-flag bookkeeping the grill's app exposes collapses
//! here into two values: a [`DerivedState`] snapshot handed to the host
//! after every poll, and a [`SessionMemory`] record the controller owns
//! for the lifetime of the device.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Instant;

use crate::status::Status;

/// Reachability of the grill as of the latest poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Connectivity {
    Online,
    Offline,
    AuthFailing { grill_on: bool },
}

/// Operational phase of the cook, reduced from component states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Off,
    Preheating,
    Heating,
    AtTemp,
    Cooling,
}

/// User-visible status line, rendered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusMessage {
    Connected,
    ConnectedRediscovered,
    ConnectedPeriodicRediscovery,
    Disconnected,
    Cooling,
    Preheating,
    Heating,
    AtTemp,
    GrillOff,
    GrillPriming,
    GrillPrimeOff,
    AuthIssueGrillOn,
    AuthIssueGrillOff,
    UsingCachedStatus,
    MainTempError,
    PanicLostConnection,
    HardwareError(&'static str),
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatusMessage::Connected => "Connected",
            StatusMessage::ConnectedRediscovered => "Connected (Rediscovered)",
            StatusMessage::ConnectedPeriodicRediscovery => "Connected (Periodic Rediscovery)",
            StatusMessage::Disconnected => "Disconnected",
            StatusMessage::Cooling => "Connected (Cooling)",
            StatusMessage::Preheating => "Connected (Preheating)",
            StatusMessage::Heating => "Connected (Heating)",
            StatusMessage::AtTemp => "Connected (At Temp)",
            StatusMessage::GrillOff => "Connected (Grill Off)",
            StatusMessage::GrillPriming => "Connected (Grill Priming)",
            StatusMessage::GrillPrimeOff => "Connected (Grill Prime Off)",
            StatusMessage::AuthIssueGrillOn => "Auth Issue (Grill On)",
            StatusMessage::AuthIssueGrillOff => "Auth Issue (Grill Off)",
            StatusMessage::UsingCachedStatus => "Msg Delay: Last Known",
            StatusMessage::MainTempError => "Error with Main Temp",
            StatusMessage::PanicLostConnection => "PANIC: Lost Connection (Grill Was On!)",
            StatusMessage::HardwareError(label) => label,
        };
        f.write_str(text)
    }
}

/// Snapshot the host receives after every poll.
#[derive(Debug, Clone, Serialize)]
pub struct DerivedState {
    pub connectivity: Connectivity,
    pub operation: Operation,
    pub panic: bool,
    pub message: StatusMessage,
    /// Component-based estimate of current draw, watts.
    pub power_w: f64,
    pub last_status: Option<Status>,
}

impl Default for DerivedState {
    fn default() -> Self {
        Self {
            connectivity: Connectivity::Offline,
            operation: Operation::Off,
            panic: false,
            message: StatusMessage::Disconnected,
            power_w: 0.0,
            last_status: None,
        }
    }
}

/// Input to one reducer step.
#[derive(Debug, Clone)]
pub enum ReduceInput {
    /// A successfully decoded poll.
    Fresh(Status),
    /// Transport or protocol failure.
    Offline,
    /// Both auth tokens rejected. `grill_on` overrides the remembered
    /// switch state when the caller knows better.
    AuthFail { grill_on: Option<bool> },
}

/// Per-device memory spanning one session (between complete shutdowns).
#[derive(Debug, Clone, Default)]
pub struct SessionMemory {
    pub grill_start_time: Option<Instant>,
    pub last_target_temp: Option<u16>,
    /// Target reached within the current power cycle.
    pub session_reached_temp: bool,
    /// Target reached at any point this session; survives power cycles,
    /// cleared only on complete shutdown.
    pub session_ever_reached_temp: bool,
    /// Last instant any of motor/hot/module was observed on.
    pub last_active_time: Option<Instant>,
    pub panic_state: bool,
    pub consecutive_auth_failures: u32,
    pub first_offline_time: Option<Instant>,
    /// Last observed switch state, for polls that carry none.
    pub last_grill_on: Option<bool>,
    /// Most recent valid chamber reading, kept for short decode gaps.
    pub last_valid_grill_temp: Option<(u16, Instant)>,
    pub last_successful_check: Option<Instant>,
}

/// Event emitted to the host after each reduce.
#[derive(Debug, Clone, Serialize)]
pub struct StateUpdate {
    pub device_id: String,
    #[serde(flatten)]
    pub state: DerivedState,
    /// Rendered form of `state.message`.
    pub message_text: String,
    pub timestamp: DateTime<Utc>,
}

impl StateUpdate {
    pub fn new(device_id: impl Into<String>, state: DerivedState) -> Self {
        let message_text = state.message.to_string();
        Self {
            device_id: device_id.into(),
            state,
            message_text,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_rendering_matches_the_app() {
        assert_eq!(StatusMessage::AtTemp.to_string(), "Connected (At Temp)");
        assert_eq!(
            StatusMessage::PanicLostConnection.to_string(),
            "PANIC: Lost Connection (Grill Was On!)"
        );
        assert_eq!(StatusMessage::UsingCachedStatus.to_string(), "Msg Delay: Last Known");
        assert_eq!(StatusMessage::AuthIssueGrillOn.to_string(), "Auth Issue (Grill On)");
        assert_eq!(
            StatusMessage::HardwareError("Fan Error").to_string(),
            "Fan Error"
        );
    }

    #[test]
    fn default_state_is_offline_and_quiet() {
        let state = DerivedState::default();
        assert_eq!(state.connectivity, Connectivity::Offline);
        assert_eq!(state.operation, Operation::Off);
        assert!(!state.panic);
        assert_eq!(state.power_w, 0.0);
    }
}

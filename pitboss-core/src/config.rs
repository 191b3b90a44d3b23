//! Controller constants, preferences, and the approved-setpoint tables
//!
//! Every timing and threshold knob lives here so the scheduler, reducer,
//! and discovery modules agree on a single source of values.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::status::Unit;
use crate::{Error, Result};

/// Connect + I/O budget for a single grill request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long derived auth tokens stay valid without a full refresh.
pub const AUTH_CACHE_TIMEOUT: Duration = Duration::from_secs(4);

/// Seconds of health-check cadence when nothing overrides it.
pub const DEFAULT_REFRESH_INTERVAL: u64 = 30;

pub const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);
pub const MAX_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Absolute ceiling on any computed health interval.
pub const MAX_HEALTH_INTERVAL_HOURS: Duration = Duration::from_secs(3600);

/// A grill active this recently that goes silent triggers the panic state.
pub const PANIC_TIMEOUT: Duration = Duration::from_secs(300);

/// Delay between a successful command and the follow-up status refresh.
pub const REFRESH_DELAY: Duration = Duration::from_secs(3);

/// Window after ignition during which a bad main-temp reading is expected.
pub const STARTUP_GRACE_PERIOD: Duration = Duration::from_secs(120);

/// Fraction of the target temperature that counts as "reached".
pub const TEMP_TOLERANCE_PERCENT: f64 = 0.95;

/// Retries after a failed MCU command (with a 1 s pause in between).
pub const COMMAND_RETRY_COUNT: u32 = 1;

// Interval multipliers, most specific first.
pub const PANIC_RECOVERY_MULTIPLIER: f64 = 0.3;
pub const PREHEATING_MULTIPLIER: f64 = 0.5;
pub const ACTIVE_MULTIPLIER: f64 = 1.0;
pub const INACTIVE_MULTIPLIER: f64 = 6.0;

// Discovery / rediscovery.
pub const DEFAULT_SCAN_START_IP: u8 = 2;
pub const DEFAULT_SCAN_END_IP: u8 = 253;
pub const MAX_CONCURRENT_CONNECTIONS: usize = 10;
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const REDISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const SCAN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DISCOVERY_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const PERIODIC_REDISCOVERY_INTERVAL: Duration = Duration::from_secs(86_400);
pub const REDISCOVERY_STALE_FLAG: Duration = Duration::from_secs(300);

pub const MINIMUM_FIRMWARE_VERSION: &str = "0.5.7";

/// Sentinel value of the IP preference meaning "discover it for me".
pub const IP_AUTO_SENTINEL: &str = "auto";

pub const MIN_TEMP_F: u16 = 180;
pub const MAX_TEMP_F: u16 = 500;
pub const MIN_TEMP_C: u16 = 82;
pub const MAX_TEMP_C: u16 = 260;

/// Setpoints the grill firmware accepts, Fahrenheit.
pub const APPROVED_SETPOINTS_F: &[u16] = &[
    180, 200, 225, 250, 275, 300, 325, 350, 375, 400, 425, 450, 475, 500,
];

/// Setpoints the grill firmware accepts, Celsius.
pub const APPROVED_SETPOINTS_C: &[u16] = &[
    82, 93, 107, 121, 135, 148, 162, 176, 190, 204, 218, 232, 260,
];

/// Nominal component wattages used by the power estimate.
///
/// Every nominal figure exceeds `BASE_CONTROLLER` so component nets are
/// never negative and the estimate never drops below the base draw.
pub mod power {
    pub const BASE_CONTROLLER: f64 = 25.0;
    pub const AUGER_MOTOR: f64 = 40.0;
    pub const IGNITOR_HOT: f64 = 300.0;
    pub const FAN_LOW_OPERATION: f64 = 35.0;
    pub const FAN_HIGH_COOLING: f64 = 60.0;
    pub const LIGHT_ON: f64 = 30.0;
    pub const PRIME_ON: f64 = 45.0;
}

/// Per-device user preferences supplied by the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    /// Grill IP, or [`IP_AUTO_SENTINEL`] to let discovery find it.
    pub ip_address: String,
    /// Hub IP used to derive the scan subnet (first three octets).
    pub hub_ip: String,
    /// Health-check cadence in seconds.
    pub refresh_interval: u64,
    /// Whether a lost grill may be searched for on the subnet.
    pub auto_rediscovery: bool,
    /// Continue scanning past non-matching Pit Boss devices.
    pub scan_continue: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            ip_address: IP_AUTO_SENTINEL.to_string(),
            hub_ip: String::new(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            auto_rediscovery: true,
            scan_continue: true,
        }
    }
}

impl Preferences {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval.max(1))
    }

    /// True when the IP preference is still the discovery sentinel.
    pub fn ip_is_auto(&self) -> bool {
        self.ip_address.trim().eq_ignore_ascii_case(IP_AUTO_SENTINEL)
            || self.ip_address.trim().is_empty()
    }

    /// Validate value ranges before a controller applies these settings.
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval == 0 {
            return Err(Error::Config(
                "refreshInterval must be greater than zero".into(),
            ));
        }
        if !self.ip_is_auto() && self.ip_address.trim().parse::<Ipv4Addr>().is_err() {
            return Err(Error::Config(format!(
                "malformed IP address: {:?}",
                self.ip_address
            )));
        }
        let hub = self.hub_ip.trim();
        if !hub.is_empty() && hub.parse::<Ipv4Addr>().is_err() {
            return Err(Error::Config(format!("malformed hub IP: {:?}", self.hub_ip)));
        }
        Ok(())
    }
}

/// Host-facing temperature range for the given display unit.
pub fn temperature_range(unit: Unit) -> (u16, u16) {
    match unit {
        Unit::Fahrenheit => (MIN_TEMP_F, MAX_TEMP_F),
        Unit::Celsius => (MIN_TEMP_C, MAX_TEMP_C),
    }
}

pub fn approved_setpoints(unit: Unit) -> &'static [u16] {
    match unit {
        Unit::Fahrenheit => APPROVED_SETPOINTS_F,
        Unit::Celsius => APPROVED_SETPOINTS_C,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_per_unit() {
        assert_eq!(temperature_range(Unit::Fahrenheit), (180, 500));
        assert_eq!(temperature_range(Unit::Celsius), (82, 260));
    }

    #[test]
    fn ip_auto_sentinel_detection() {
        let mut prefs = Preferences::default();
        assert!(prefs.ip_is_auto());
        prefs.ip_address = "Auto".into();
        assert!(prefs.ip_is_auto());
        prefs.ip_address = "192.168.1.42".into();
        assert!(!prefs.ip_is_auto());
    }

    #[test]
    fn preference_validation() {
        assert!(Preferences::default().validate().is_ok());

        let pinned = Preferences {
            ip_address: "192.168.1.42".into(),
            hub_ip: "192.168.1.1".into(),
            ..Default::default()
        };
        assert!(pinned.validate().is_ok());

        let zero_interval = Preferences {
            refresh_interval: 0,
            ..Default::default()
        };
        assert!(matches!(zero_interval.validate(), Err(Error::Config(_))));

        let bad_ip = Preferences {
            ip_address: "not-an-ip".into(),
            ..Default::default()
        };
        assert!(matches!(bad_ip.validate(), Err(Error::Config(_))));

        let bad_hub = Preferences {
            hub_ip: "10.0.0".into(),
            ..Default::default()
        };
        assert!(matches!(bad_hub.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn component_nominals_exceed_base() {
        for w in [
            power::AUGER_MOTOR,
            power::IGNITOR_HOT,
            power::FAN_LOW_OPERATION,
            power::FAN_HIGH_COOLING,
            power::LIGHT_ON,
            power::PRIME_ON,
        ] {
            assert!(w >= power::BASE_CONTROLLER);
        }
    }
}

//! Typed status record decoded from the grill's `sc_11`/`sc_12` blobs
//!
//! `PB.GetState` returns two variable-length hex blobs. Byte offsets inside
//! them are fixed by firmware; a blob shorter than an offset demands means
//! the field takes its defensive default (booleans false, temperatures
//! disconnected, unit Fahrenheit).

use serde::{Deserialize, Serialize};

use crate::codec::decode_hex;

/// Display unit reported by the grill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "F")]
    Fahrenheit,
    #[serde(rename = "C")]
    Celsius,
}

impl Default for Unit {
    fn default() -> Self {
        Unit::Fahrenheit
    }
}

/// A probe or chamber reading: degrees in the native unit, or no probe.
///
/// Serialises as a plain number, with `null` for a disconnected probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Option<u16>", from = "Option<u16>")]
pub enum Temperature {
    Degrees(u16),
    Disconnected,
}

impl From<Temperature> for Option<u16> {
    fn from(t: Temperature) -> Self {
        t.degrees()
    }
}

impl From<Option<u16>> for Temperature {
    fn from(v: Option<u16>) -> Self {
        match v {
            Some(d) => Temperature::Degrees(d),
            None => Temperature::Disconnected,
        }
    }
}

impl Temperature {
    pub fn degrees(self) -> Option<u16> {
        match self {
            Temperature::Degrees(d) => Some(d),
            Temperature::Disconnected => None,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, Temperature::Degrees(_))
    }
}

impl Default for Temperature {
    fn default() -> Self {
        Temperature::Disconnected
    }
}

/// Hardware error flags, in the order the firmware packs them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrillErrors {
    pub error_1: bool,
    pub error_2: bool,
    pub error_3: bool,
    pub high_temp: bool,
    pub fan: bool,
    pub hot: bool,
    pub motor: bool,
    pub no_pellets: bool,
    pub erl: bool,
}

impl GrillErrors {
    pub fn any(&self) -> bool {
        self.error_1
            || self.error_2
            || self.error_3
            || self.high_temp
            || self.fan
            || self.hot
            || self.motor
            || self.no_pellets
            || self.erl
    }

    /// First raised flag as a short user-facing label.
    pub fn first_label(&self) -> Option<&'static str> {
        let flags = [
            (self.high_temp, "High Temp Error"),
            (self.fan, "Fan Error"),
            (self.hot, "Ignitor Error"),
            (self.motor, "Auger Error"),
            (self.no_pellets, "No Pellets"),
            (self.erl, "ERL Error"),
            (self.error_1, "Error 1"),
            (self.error_2, "Error 2"),
            (self.error_3, "Error 3"),
        ];
        flags.iter().find(|(on, _)| *on).map(|(_, label)| *label)
    }
}

/// Decoded snapshot of everything one poll can observe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub unit: Unit,
    pub grill_temp: Temperature,
    pub set_temp: Temperature,
    pub smoker_temp: Temperature,
    pub p1_temp: Temperature,
    pub p2_temp: Temperature,
    pub p3_temp: Temperature,
    pub p4_temp: Temperature,
    pub p1_target: Temperature,
    pub module_on: bool,
    pub motor_state: bool,
    pub hot_state: bool,
    pub fan_state: bool,
    pub light_state: bool,
    pub prime_state: bool,
    pub errors: GrillErrors,
    pub recipe_step: Option<u8>,
    /// Remaining recipe time as (hours, minutes, seconds).
    pub recipe_time: Option<(u8, u8, u8)>,
}

impl Status {
    /// Whether the grill counts as running for session purposes.
    pub fn grill_on(&self) -> bool {
        self.motor_state || self.hot_state || self.module_on
    }

    pub fn any_probe_connected(&self) -> bool {
        self.p1_temp.is_connected()
            || self.p2_temp.is_connected()
            || self.p3_temp.is_connected()
            || self.p4_temp.is_connected()
    }
}

/// Read a temperature triple `(hundreds, tens, units)` at `offset`.
///
/// The firmware encodes missing probes with a handful of sentinel triples;
/// all of them, plus anything computing to 960, read as disconnected.
pub fn convert_temperature(bytes: &[u8], offset: usize) -> Temperature {
    let (h, t, u) = match (
        bytes.get(offset),
        bytes.get(offset + 1),
        bytes.get(offset + 2),
    ) {
        (Some(&h), Some(&t), Some(&u)) => (h, t, u),
        _ => return Temperature::Disconnected,
    };
    if matches!((h, t, u), (0, 9, 6) | (0, 0, 0) | (255, 255, 255)) {
        return Temperature::Disconnected;
    }
    let value = 100 * h as u16 + 10 * t as u16 + u as u16;
    if value == 960 {
        return Temperature::Disconnected;
    }
    Temperature::Degrees(value)
}

fn flag(bytes: &[u8], offset: usize) -> bool {
    bytes.get(offset).copied().unwrap_or(0) != 0
}

/// Decode both status blobs into a typed [`Status`].
pub fn parse_status(sc_11_hex: &str, sc_12_hex: &str) -> Status {
    let a = decode_hex(sc_11_hex);
    let b = decode_hex(sc_12_hex);

    let unit = match b.get(26) {
        Some(0) => Unit::Celsius,
        Some(_) => Unit::Fahrenheit,
        None => Unit::default(),
    };

    let recipe_step = a.get(40).copied().filter(|&s| s != 0);
    let recipe_time = match (a.get(41), a.get(42), a.get(43)) {
        (Some(&h), Some(&m), Some(&s)) if h != 0 || m != 0 || s != 0 => Some((h, m, s)),
        _ => None,
    };

    Status {
        unit,
        p1_target: convert_temperature(&b, 2),
        p1_temp: convert_temperature(&b, 5),
        p2_temp: convert_temperature(&b, 8),
        p3_temp: convert_temperature(&b, 11),
        p4_temp: convert_temperature(&b, 14),
        set_temp: convert_temperature(&b, 20),
        grill_temp: convert_temperature(&b, 23),
        smoker_temp: convert_temperature(&a, 20),
        module_on: flag(&a, 24),
        errors: GrillErrors {
            error_1: flag(&a, 25),
            error_2: flag(&a, 26),
            error_3: flag(&a, 27),
            high_temp: flag(&a, 28),
            fan: flag(&a, 29),
            hot: flag(&a, 30),
            motor: flag(&a, 31),
            no_pellets: flag(&a, 32),
            erl: flag(&a, 33),
        },
        fan_state: flag(&a, 34),
        hot_state: flag(&a, 35),
        motor_state: flag(&a, 36),
        light_state: flag(&a, 37),
        prime_state: flag(&a, 38),
        recipe_step,
        recipe_time,
    }
}

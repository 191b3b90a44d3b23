//! Typed RPC endpoints and MCU command encoding
//!
//! All grill RPC is JSON-over-POST against `/rpc/*`. Authenticated
//! endpoints carry `{time, psw}`; a rejected request is retried once with
//! the alternate token for the next time bucket before giving up, which
//! rides out the grill's clock ticking over mid-exchange.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::AuthCache;
use crate::config::{
    approved_setpoints, temperature_range, MINIMUM_FIRMWARE_VERSION,
};
use crate::http::HttpClient;
use crate::status::Unit;
use crate::{Error, Result};

/// Raw `PB.GetState` payload, still hex-encoded.
#[derive(Debug, Clone, Deserialize)]
pub struct RawState {
    pub sc_11: String,
    pub sc_12: String,
}

/// `Sys.GetInfo` response; `app` is `"PitBoss"` on the real hardware.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemInfo {
    pub id: String,
    pub app: String,
    #[serde(default)]
    pub fw: Option<String>,
    #[serde(default)]
    pub hw: Option<String>,
}

impl SystemInfo {
    pub fn is_pitboss(&self) -> bool {
        self.app.eq_ignore_ascii_case("PitBoss")
    }
}

/// RPC client for a single grill, identified per-call by IP.
#[derive(Clone)]
pub struct GrillClient {
    http: HttpClient,
    auth: Arc<AuthCache>,
}

impl GrillClient {
    pub fn new(http: HttpClient, auth: Arc<AuthCache>) -> Self {
        Self { http, auth }
    }

    pub fn auth(&self) -> &Arc<AuthCache> {
        &self.auth
    }

    /// Fetch the two status blobs.
    pub async fn get_state(&self, ip: &str) -> Result<RawState> {
        let body = self.call_authenticated(ip, "PB.GetState", json!({})).await?;
        serde_json::from_value(body)
            .map_err(|e| Error::ProtocolDecode(format!("PB.GetState: {}", e)))
    }

    /// Send a raw MCU command (hex-encoded bytes).
    pub async fn send_mcu_command(&self, ip: &str, command_hex: &str) -> Result<()> {
        self.call_authenticated(ip, "PB.SendMCUCommand", json!({ "command": command_hex }))
            .await?;
        Ok(())
    }

    pub async fn get_firmware_version(&self, ip: &str) -> Result<String> {
        let resp = self
            .http
            .post_json(&format!("http://{}/rpc/PB.GetFirmwareVersion", ip), &json!({}))
            .await?;
        if !resp.is_success() {
            return Err(Error::Send(format!(
                "PB.GetFirmwareVersion returned {}",
                resp.status
            )));
        }
        resp.json()?
            .get("firmwareVersion")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::ProtocolDecode("missing firmwareVersion".into()))
    }

    /// Unauthenticated identity probe, also used by discovery.
    pub async fn get_system_info(&self, ip: &str) -> Result<SystemInfo> {
        let resp = self
            .http
            .post_json(&format!("http://{}/rpc/Sys.GetInfo", ip), &json!({}))
            .await?;
        if !resp.is_success() {
            return Err(Error::Send(format!("Sys.GetInfo returned {}", resp.status)));
        }
        serde_json::from_str(&resp.body)
            .map_err(|e| Error::ProtocolDecode(format!("Sys.GetInfo: {}", e)))
    }

    /// POST with auth material, retrying once on the alternate token.
    async fn call_authenticated(&self, ip: &str, method: &str, extra: Value) -> Result<Value> {
        let tokens = self.auth.tokens(ip).await?;
        let url = format!("http://{}/rpc/{}", ip, method);

        let mut body = extra.clone();
        body["time"] = json!(tokens.time_int);
        body["psw"] = json!(tokens.psw_hex);
        let resp = self.http.post_json(&url, &body).await?;
        if resp.is_success() {
            return resp.json();
        }

        debug!(ip, method, status = resp.status, "primary token rejected, retrying");
        let mut body = extra;
        body["time"] = json!(tokens.time_int + 1);
        body["psw"] = json!(tokens.psw_hex_plus1);
        let resp = self.http.post_json(&url, &body).await?;
        if resp.is_success() {
            return resp.json();
        }

        warn!(ip, method, status = resp.status, "both auth tokens rejected");
        self.auth.invalidate(ip);
        Err(Error::AuthenticationFailed)
    }
}

fn encode_command(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Encode a set-temperature command after validating the unit's range.
pub fn encode_set_temperature(temp: u16, unit: Unit) -> Result<String> {
    let (min, max) = temperature_range(unit);
    if temp < min || temp > max {
        return Err(Error::InvalidArgument(format!(
            "temperature {} outside {}..={}",
            temp, min, max
        )));
    }
    let hundreds = (temp / 100) as u8;
    let tens = ((temp / 10) % 10) as u8;
    let units = (temp % 10) as u8;
    Ok(encode_command(&[0xFE, 0x05, 0x01, hundreds, tens, units, 0xFF]))
}

pub fn encode_set_light(on: bool) -> String {
    encode_command(&[0xFE, 0x02, on as u8, 0xFF])
}

pub fn encode_set_prime(on: bool) -> String {
    encode_command(&[0xFE, 0x08, on as u8, 0xFF])
}

/// Power byte is 0x01 for on and 0x02 for off.
pub fn encode_set_power(on: bool) -> String {
    encode_command(&[0xFE, 0x01, if on { 0x01 } else { 0x02 }, 0xFF])
}

pub fn encode_set_unit(celsius: bool) -> String {
    encode_command(&[0xFE, 0x09, if celsius { 0x02 } else { 0x01 }, 0xFF])
}

/// Closest approved setpoint, ties resolved toward the lower value.
pub fn snap_to_approved(temp: u16, unit: Unit) -> u16 {
    let list = approved_setpoints(unit);
    let mut best = list[0];
    for &s in list {
        if s.abs_diff(temp) < best.abs_diff(temp) {
            best = s;
        }
    }
    best
}

/// Dotted-numeric comparison against [`MINIMUM_FIRMWARE_VERSION`].
///
/// Missing components read as zero, so `"1.0"` compares as `1.0.0`.
/// Anything unparseable is invalid.
pub fn is_firmware_valid(version: &str) -> bool {
    match (parse_version(version), parse_version(MINIMUM_FIRMWARE_VERSION)) {
        (Some(v), Some(min)) => v >= min,
        _ => false,
    }
}

fn parse_version(v: &str) -> Option<(u32, u32, u32)> {
    let v = v.trim();
    if v.is_empty() {
        return None;
    }
    let mut parts = [0u32; 3];
    for (i, component) in v.split('.').enumerate() {
        if i >= 3 {
            break;
        }
        parts[i] = component.parse().ok()?;
    }
    Some((parts[0], parts[1], parts[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_command_encoding() {
        assert_eq!(
            encode_set_temperature(250, Unit::Fahrenheit).unwrap(),
            "FE0501020500FF"
        );
        assert_eq!(
            encode_set_temperature(225, Unit::Fahrenheit).unwrap(),
            "FE0501020205FF"
        );
        assert_eq!(
            encode_set_temperature(107, Unit::Celsius).unwrap(),
            "FE0501010007FF"
        );
    }

    #[test]
    fn temperature_range_is_enforced() {
        assert!(matches!(
            encode_set_temperature(600, Unit::Fahrenheit),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            encode_set_temperature(100, Unit::Fahrenheit),
            Err(Error::InvalidArgument(_))
        ));
        assert!(encode_set_temperature(180, Unit::Fahrenheit).is_ok());
        assert!(encode_set_temperature(500, Unit::Fahrenheit).is_ok());
    }

    #[test]
    fn toggle_command_encoding() {
        assert_eq!(encode_set_light(true), "FE0201FF");
        assert_eq!(encode_set_light(false), "FE0200FF");
        assert_eq!(encode_set_prime(true), "FE0801FF");
        assert_eq!(encode_set_prime(false), "FE0800FF");
        assert_eq!(encode_set_power(true), "FE0101FF");
        // Off is 0x02, not 0x00.
        assert_eq!(encode_set_power(false), "FE0102FF");
        assert_eq!(encode_set_unit(true), "FE0902FF");
        assert_eq!(encode_set_unit(false), "FE0901FF");
    }

    #[test]
    fn snapping_picks_the_nearest_setpoint() {
        for (input, expected) in [
            (180, 180),
            (190, 180), // tie with 200 resolves low
            (191, 200),
            (237, 225),
            (238, 250),
            (1000, 500),
            (0, 180),
        ] {
            let snapped = snap_to_approved(input, Unit::Fahrenheit);
            assert_eq!(snapped, expected, "snap({})", input);
            assert!(approved_setpoints(Unit::Fahrenheit).contains(&snapped));
        }
        assert_eq!(snap_to_approved(100, Unit::Celsius), 93);
    }

    #[test]
    fn firmware_validation() {
        assert!(is_firmware_valid("0.5.7"));
        assert!(!is_firmware_valid("0.5.6"));
        assert!(is_firmware_valid("1.0"));
        assert!(is_firmware_valid("0.6"));
        assert!(!is_firmware_valid(""));
        assert!(!is_firmware_valid("abc"));
        assert!(is_firmware_valid("0.5.7.9"));
    }
}

//! Host-supplied per-device key-value store
//!
//! The host owns durable storage; the core only sees an opaque keyed store
//! with an advisory persistence flag. Key names are stable across releases
//! because the host may migrate them between driver versions.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// Stable field key names.
pub mod keys {
    pub const IP_ADDRESS: &str = "ip_address";
    pub const MAC_ADDRESS: &str = "mac_address";
    pub const DEVICE_NETWORK_ID: &str = "device_network_id";
    pub const HEALTH_TIMER_ID: &str = "health_timer_id";
    pub const LAST_HEALTH_SCHEDULED: &str = "last_health_scheduled";
    pub const FIRST_HEALTH_CHECK_AFTER_SETUP: &str = "first_health_check_after_setup";
    pub const LAST_SUCCESSFUL_HEALTH_CHECK: &str = "last_successful_health_check";
    pub const IS_POLLING: &str = "is_polling";
    pub const LAST_NETWORK_ERROR: &str = "last_network_error";
    pub const CONSECUTIVE_AUTH_FAILURES: &str = "consecutive_auth_failures";
    pub const PANIC_STATE: &str = "panic_state";
    pub const LAST_ACTIVE_TIME: &str = "last_active_time";
    pub const GRILL_START_TIME: &str = "grill_start_time";
    pub const LAST_TARGET_TEMP: &str = "last_target_temp";
    pub const SESSION_REACHED_TEMP: &str = "session_reached_temp";
    pub const SESSION_EVER_REACHED_TEMP: &str = "session_ever_reached_temp";
    pub const IS_CONNECTED: &str = "is_connected";
    pub const FIRST_OFFLINE_TIME: &str = "first_offline_time";
    pub const LAST_REDISCOVERY_ATTEMPT: &str = "last_rediscovery_attempt";
    pub const LAST_SUCCESSFUL_REDISCOVERY: &str = "last_successful_rediscovery";
    pub const REDISCOVERY_IN_PROGRESS: &str = "rediscovery_in_progress";
    pub const REDISCOVERY_START_TIME: &str = "rediscovery_start_time";
    pub const LAST_SCAN_POSITION: &str = "last_scan_position";
    pub const TIMER_RECOVERY_FAILED: &str = "timer_recovery_failed";
    pub const LAST_PROCESSED_PREFS: &str = "last_processed_prefs";
    pub const UNIT: &str = "unit";
    pub const PRIME_AUTO_OFF_TIMER: &str = "prime_auto_off_timer";
}

/// Opaque keyed store exposed by the host.
///
/// `persist` is advisory: fields flagged with it must survive a process
/// restart, everything else may be dropped. Failures to persist are the
/// host's to log; the trait itself is infallible so a flaky store never
/// aborts a poll tick.
pub trait DeviceFieldStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value, persist: bool);
    fn clear(&self, key: &str);
}

/// Typed accessors over the untyped store.
pub trait FieldExt: DeviceFieldStore {
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.as_u64()
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_f64()
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)?.as_str().map(str::to_string)
    }

    fn set_bool(&self, key: &str, value: bool, persist: bool) {
        self.set(key, Value::Bool(value), persist);
    }

    fn set_u64(&self, key: &str, value: u64, persist: bool) {
        self.set(key, Value::from(value), persist);
    }

    fn set_f64(&self, key: &str, value: f64, persist: bool) {
        self.set(key, Value::from(value), persist);
    }

    fn set_string(&self, key: &str, value: &str, persist: bool) {
        self.set(key, Value::from(value), persist);
    }
}

impl<T: DeviceFieldStore + ?Sized> FieldExt for T {}

/// In-memory store used by the agent binary and the test suite.
#[derive(Default)]
pub struct MemoryFieldStore {
    fields: RwLock<HashMap<String, Value>>,
}

impl MemoryFieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.fields.read().clone()
    }
}

impl DeviceFieldStore for MemoryFieldStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.fields.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value, _persist: bool) {
        self.fields.write().insert(key.to_string(), value);
    }

    fn clear(&self, key: &str) {
        self.fields.write().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_round_trips() {
        let store = MemoryFieldStore::new();
        store.set_bool(keys::IS_POLLING, true, false);
        store.set_u64(keys::CONSECUTIVE_AUTH_FAILURES, 2, true);
        store.set_string(keys::IP_ADDRESS, "192.168.1.42", true);

        assert_eq!(store.get_bool(keys::IS_POLLING), Some(true));
        assert_eq!(store.get_u64(keys::CONSECUTIVE_AUTH_FAILURES), Some(2));
        assert_eq!(store.get_string(keys::IP_ADDRESS), Some("192.168.1.42".into()));
        assert_eq!(store.get_bool(keys::PANIC_STATE), None);
    }

    #[test]
    fn clear_removes_the_key() {
        let store = MemoryFieldStore::new();
        store.set_bool(keys::PANIC_STATE, true, true);
        store.clear(keys::PANIC_STATE);
        assert_eq!(store.get(keys::PANIC_STATE), None);
    }

    #[test]
    fn type_mismatch_reads_as_none() {
        let store = MemoryFieldStore::new();
        store.set_string(keys::PANIC_STATE, "yes", false);
        assert_eq!(store.get_bool(keys::PANIC_STATE), None);
    }
}

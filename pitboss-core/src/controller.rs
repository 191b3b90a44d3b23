// SPDX-License-Identifier: MIT
//
// Pit Boss LAN Controller
// https://github.com/pitboss-lan/pitboss-lan

//! Device controller: owns the poll loop and all per-device state
//!
//! One controller drives one grill. It is the sole mutator of the device's
//! session memory, auth cache entries, and timer token; collaborators see
//! state only through emitted [`StateUpdate`]s and the host field store.
//! The loop is cooperatively scheduled: a tick either completes, arming
//! its successor, or parks on an I/O suspension point.

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Preferences, COMMAND_RETRY_COUNT, REFRESH_DELAY};
use crate::discovery::{RediscoveryOutcome, RediscoveryService};
use crate::fields::{keys, DeviceFieldStore, FieldExt};
use crate::panic;
use crate::reducer::reduce;
use crate::rpc::{self, GrillClient};
use crate::scheduler::{self, IntervalInputs, TimerToken};
use crate::state::{
    Connectivity, DerivedState, Operation, ReduceInput, SessionMemory, StateUpdate, StatusMessage,
};
use crate::status::{parse_status, Unit};
use crate::{Error, Result};

/// User commands accepted by [`GrillController::send_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Target temperature in the grill's current display unit; snapped to
    /// the nearest approved setpoint before encoding.
    SetTemperature(u16),
    SetLight(bool),
    SetPrime(bool),
    SetPower(bool),
    SetUnit(Unit),
}

pub struct GrillController {
    inner: Arc<Inner>,
}

struct Inner {
    /// Self-reference handed to spawned timer tasks.
    me: Weak<Inner>,
    device_id: String,
    fields: Arc<dyn DeviceFieldStore>,
    client: GrillClient,
    rediscovery: Arc<RediscoveryService>,
    prefs: RwLock<Preferences>,
    mem: Mutex<SessionMemory>,
    derived: Mutex<DerivedState>,
    events: mpsc::UnboundedSender<StateUpdate>,
    shutdown: CancellationToken,
    is_polling: AtomicBool,
    timer: Mutex<Option<TimerToken>>,
    timer_seq: AtomicU64,
    first_after_setup: AtomicBool,
}

impl GrillController {
    pub fn new(
        device_id: impl Into<String>,
        fields: Arc<dyn DeviceFieldStore>,
        client: GrillClient,
        rediscovery: Arc<RediscoveryService>,
        prefs: Preferences,
        events: mpsc::UnboundedSender<StateUpdate>,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            inner: Arc::new_cyclic(|me| Inner {
                me: me.clone(),
                device_id,
                fields,
                client,
                rediscovery,
                prefs: RwLock::new(prefs),
                mem: Mutex::new(SessionMemory::default()),
                derived: Mutex::new(DerivedState::default()),
                events,
                shutdown: CancellationToken::new(),
                is_polling: AtomicBool::new(false),
                timer: Mutex::new(None),
                timer_seq: AtomicU64::new(0),
                first_after_setup: AtomicBool::new(true),
            }),
        }
    }

    /// Device added: capture metadata and arm the first tick.
    pub async fn init(&self) -> Result<()> {
        let inner = &self.inner;
        info!(device_id = %inner.device_id, "initialising controller");

        let prefs = inner.prefs.read().clone();
        prefs.validate()?;
        if !prefs.ip_is_auto() {
            inner
                .fields
                .set_string(keys::IP_ADDRESS, &prefs.ip_address, true);
        }

        // Best-effort metadata grab; a dark grill is handled by the loop.
        if let Some(ip) = inner.current_ip() {
            match inner.client.get_system_info(&ip).await {
                Ok(info) => {
                    inner
                        .fields
                        .set_string(keys::DEVICE_NETWORK_ID, &info.id, true);
                    if let Some(fw) = &info.fw {
                        if !rpc::is_firmware_valid(fw) {
                            warn!(device_id = %inner.device_id, fw, "firmware below supported minimum");
                        }
                    }
                }
                Err(e) => debug!(device_id = %inner.device_id, "metadata probe failed: {}", e),
            }
        }

        inner.first_after_setup.store(true, Ordering::SeqCst);
        inner
            .fields
            .set_bool(keys::FIRST_HEALTH_CHECK_AFTER_SETUP, true, true);
        // Arming through next_interval consumes the flag, so the short
        // first-after-setup interval is applied to exactly one tick.
        let interval = inner.next_interval();
        inner.arm_timer(interval)
    }

    /// Manual poll, rejected while a scheduled one is in flight.
    pub async fn refresh(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.is_polling.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidArgument("poll already in flight".into()));
        }
        inner.fields.set_bool(keys::IS_POLLING, true, false);
        inner.run_poll().await;
        inner.is_polling.store(false, Ordering::SeqCst);
        inner.fields.set_bool(keys::IS_POLLING, false, false);
        inner.ensure_timer_active();
        Ok(())
    }

    /// Encode and send a user command, with a pre-flight health check and
    /// one retry, then schedule a deferred refresh to pick up its effect.
    pub async fn send_command(&self, cmd: Command) -> Result<()> {
        let inner = &self.inner;
        let ip = inner
            .current_ip()
            .ok_or_else(|| Error::InvalidArgument("device has no known IP".into()))?;

        inner.client.get_system_info(&ip).await?;

        let command_hex = inner.encode_command(cmd)?;
        let mut attempt = 0u32;
        loop {
            match inner.client.send_mcu_command(&ip, &command_hex).await {
                Ok(()) => break,
                Err(e) if attempt < COMMAND_RETRY_COUNT && e.is_transport() => {
                    attempt += 1;
                    warn!(device_id = %inner.device_id, "command failed, retrying: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e),
            }
        }

        if let Command::SetPrime(on) = cmd {
            let message = if on {
                StatusMessage::GrillPriming
            } else {
                StatusMessage::GrillPrimeOff
            };
            inner.emit_with_message(message);
        }

        // Read back the command's effect shortly after the MCU applies it.
        let deferred = Arc::clone(inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = deferred.shutdown.cancelled() => {}
                _ = tokio::time::sleep(REFRESH_DELAY) => {
                    if !deferred.is_polling.swap(true, Ordering::SeqCst) {
                        deferred.fields.set_bool(keys::IS_POLLING, true, false);
                        deferred.run_poll().await;
                        deferred.is_polling.store(false, Ordering::SeqCst);
                        deferred.fields.set_bool(keys::IS_POLLING, false, false);
                    }
                }
            }
        });
        Ok(())
    }

    /// Apply a preference change, skipping repeats of the same content.
    /// Invalid values are rejected before any state is touched.
    pub async fn on_prefs_changed(&self, new: Preferences) -> Result<()> {
        let inner = &self.inner;
        new.validate()?;
        let hash = prefs_hash(&new)?;
        if inner.fields.get_string(keys::LAST_PROCESSED_PREFS).as_deref() == Some(hash.as_str()) {
            debug!(device_id = %inner.device_id, "preferences unchanged, skipping");
            return Ok(());
        }

        let old = {
            let mut prefs = inner.prefs.write();
            std::mem::replace(&mut *prefs, new.clone())
        };
        inner
            .fields
            .set_string(keys::LAST_PROCESSED_PREFS, &hash, true);

        if old.ip_address != new.ip_address {
            if new.ip_is_auto() {
                // Back to automatic: forget the pinned address and, when
                // allowed, go looking for the grill right away.
                inner.fields.clear(keys::IP_ADDRESS);
                inner.client.auth().invalidate(&old.ip_address);
                if new.auto_rediscovery {
                    inner.run_rediscovery(true).await;
                }
            } else {
                info!(device_id = %inner.device_id, ip = %new.ip_address, "IP preference changed");
                inner
                    .fields
                    .set_string(keys::IP_ADDRESS, &new.ip_address, true);
                inner.client.auth().invalidate(&old.ip_address);
                inner.client.auth().invalidate(&new.ip_address);
            }
        }

        if old.refresh_interval != new.refresh_interval {
            let interval = inner.next_interval();
            if let Err(e) = inner.arm_timer(interval) {
                warn!(device_id = %inner.device_id, "re-arm after pref change failed: {}", e);
            }
        }
        Ok(())
    }

    /// Device removed: stop everything and clear transient fields.
    pub async fn remove(&self) {
        let inner = &self.inner;
        info!(device_id = %inner.device_id, "removing controller");
        inner.shutdown.cancel();
        if let Some(token) = inner.timer.lock().take() {
            token.cancel();
        }
        for key in [
            keys::HEALTH_TIMER_ID,
            keys::LAST_HEALTH_SCHEDULED,
            keys::IS_POLLING,
            keys::PANIC_STATE,
            keys::LAST_ACTIVE_TIME,
            keys::GRILL_START_TIME,
            keys::FIRST_OFFLINE_TIME,
            keys::TIMER_RECOVERY_FAILED,
            keys::REDISCOVERY_IN_PROGRESS,
        ] {
            inner.fields.clear(key);
        }
    }

    /// Current derived state snapshot.
    pub fn derived(&self) -> DerivedState {
        self.inner.derived.lock().clone()
    }
}

impl Inner {
    /// IP the device is currently believed to live at.
    fn current_ip(&self) -> Option<String> {
        if let Some(ip) = self.fields.get_string(keys::IP_ADDRESS) {
            if !ip.is_empty() {
                return Some(ip);
            }
        }
        let prefs = self.prefs.read();
        if prefs.ip_is_auto() {
            None
        } else {
            Some(prefs.ip_address.clone())
        }
    }

    fn encode_command(&self, cmd: Command) -> Result<String> {
        match cmd {
            Command::SetTemperature(t) => {
                let unit = self.current_unit();
                let (min, max) = crate::config::temperature_range(unit);
                if t < min || t > max {
                    return Err(Error::InvalidArgument(format!(
                        "temperature {} outside {}..={}",
                        t, min, max
                    )));
                }
                rpc::encode_set_temperature(rpc::snap_to_approved(t, unit), unit)
            }
            Command::SetLight(on) => Ok(rpc::encode_set_light(on)),
            Command::SetPrime(on) => Ok(rpc::encode_set_prime(on)),
            Command::SetPower(on) => Ok(rpc::encode_set_power(on)),
            Command::SetUnit(unit) => Ok(rpc::encode_set_unit(unit == Unit::Celsius)),
        }
    }

    fn current_unit(&self) -> Unit {
        if let Some(status) = &self.derived.lock().last_status {
            return status.unit;
        }
        match self.fields.get_string(keys::UNIT).as_deref() {
            Some("C") => Unit::Celsius,
            _ => Unit::Fahrenheit,
        }
    }

    /// One poll: RPC, decode, reduce, mirror, emit; rediscovery on loss.
    async fn run_poll(&self) {
        let input = match self.current_ip() {
            Some(ip) => match self.client.get_state(&ip).await {
                Ok(raw) => ReduceInput::Fresh(parse_status(&raw.sc_11, &raw.sc_12)),
                Err(e) if e.is_auth() => {
                    warn!(device_id = %self.device_id, "authentication failed");
                    ReduceInput::AuthFail { grill_on: None }
                }
                Err(e) => {
                    debug!(device_id = %self.device_id, "poll failed: {}", e);
                    self.fields
                        .set_string(keys::LAST_NETWORK_ERROR, &e.to_string(), false);
                    ReduceInput::Offline
                }
            },
            None => ReduceInput::Offline,
        };

        let lost = matches!(input, ReduceInput::Offline);
        self.apply_input(input);

        if lost {
            let prefs = self.prefs.read().clone();
            if prefs.auto_rediscovery && prefs.ip_is_auto() {
                self.run_rediscovery(false).await;
            }
        }
    }

    /// Reduce one input into the derived state and publish it.
    fn apply_input(&self, input: ReduceInput) {
        let now = Instant::now();
        let prefs = self.prefs.read().clone();
        let next = {
            let mut mem = self.mem.lock();
            let mut derived = self.derived.lock();
            let next = reduce(&derived, &mut mem, &prefs, input, now);
            mirror_memory(self.fields.as_ref(), &mem, &next, now);
            *derived = next.clone();
            next
        };
        let _ = self
            .events
            .send(StateUpdate::new(self.device_id.clone(), next));
    }

    /// Publish the current state with a substituted message.
    fn emit_with_message(&self, message: StatusMessage) {
        let state = {
            let mut derived = self.derived.lock();
            derived.message = message;
            derived.clone()
        };
        let _ = self.events.send(StateUpdate::new(self.device_id.clone(), state));
    }

    /// Run a rediscovery pass and apply its outcome.
    async fn run_rediscovery(&self, bypass: bool) {
        let prefs = self.prefs.read().clone();
        let outcome = self
            .rediscovery
            .rediscover(&self.device_id, self.fields.as_ref(), &prefs, bypass, &self.shutdown)
            .await;
        match outcome {
            Ok(RediscoveryOutcome::Found { ip, info }) => {
                self.fields.set_string(keys::IP_ADDRESS, &ip, true);
                self.fields.set_string(keys::DEVICE_NETWORK_ID, &info.id, true);
                self.client.auth().invalidate(&ip);
                {
                    let mut mem = self.mem.lock();
                    panic::update_on_success(&mut mem);
                    let mut derived = self.derived.lock();
                    derived.connectivity = Connectivity::Online;
                    derived.panic = false;
                    derived.message = if bypass {
                        StatusMessage::ConnectedRediscovered
                    } else {
                        StatusMessage::ConnectedPeriodicRediscovery
                    };
                }
                self.emit_current();
            }
            Ok(RediscoveryOutcome::RateLimited { retry_after }) => {
                debug!(device_id = %self.device_id, ?retry_after, "rediscovery not attempted");
            }
            Ok(RediscoveryOutcome::AlreadyRunning) => {
                debug!(device_id = %self.device_id, "rediscovery already in flight");
            }
            Ok(RediscoveryOutcome::TimedOut { resume_at }) => {
                info!(device_id = %self.device_id, resume_at, "rediscovery deadline, will resume");
            }
            Ok(RediscoveryOutcome::NotFound) => {
                info!(device_id = %self.device_id, "rediscovery swept the subnet without a match");
            }
            Err(e) => warn!(device_id = %self.device_id, "rediscovery failed: {}", e),
        }
    }

    fn emit_current(&self) {
        let state = self.derived.lock().clone();
        let _ = self.events.send(StateUpdate::new(self.device_id.clone(), state));
    }

    /// Interval for the next tick given the current derived state.
    fn next_interval(&self) -> Duration {
        let prefs = self.prefs.read().clone();
        if self.first_after_setup.swap(false, Ordering::SeqCst) {
            self.fields
                .set_bool(keys::FIRST_HEALTH_CHECK_AFTER_SETUP, false, true);
            return scheduler::first_tick_interval(&prefs);
        }
        let grill_on = self.mem.lock().last_grill_on.unwrap_or(false);
        let derived = self.derived.lock();
        let inputs = IntervalInputs {
            panic: derived.panic,
            grill_on,
            preheating: derived.operation == Operation::Preheating,
        };
        scheduler::compute_interval(&prefs, &inputs)
    }

    /// Arm the single health-check timer. Recording the token and writing
    /// the field-store record happen under one lock, atomically with task
    /// creation; any previously armed timer is cancelled first.
    fn arm_timer(&self, interval: Duration) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::TimerArmFailed("controller is shutting down".into()));
        }
        let inner = self
            .me
            .upgrade()
            .ok_or_else(|| Error::TimerArmFailed("controller dropped".into()))?;
        let id = self.timer_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut slot = self.timer.lock();
        if let Some(previous) = slot.take() {
            previous.cancel();
        }

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(interval) => {
                    tick_boxed(inner).await;
                }
            }
        });

        *slot = Some(TimerToken::new(id, Instant::now(), handle));
        self.fields.set_u64(keys::HEALTH_TIMER_ID, id, false);
        self.fields.set_f64(
            keys::LAST_HEALTH_SCHEDULED,
            chrono::Utc::now().timestamp() as f64,
            false,
        );
        debug!(device_id = %self.device_id, id, ?interval, "health timer armed");
        Ok(())
    }

    /// Arm the next tick, falling into the recovery process on failure.
    async fn arm_next_or_recover(&self) {
        let interval = self.next_interval();
        if self.arm_timer(interval).is_ok() {
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }
        for attempt in 1..=3u32 {
            let backoff = scheduler::recovery_backoff(attempt);
            warn!(device_id = %self.device_id, attempt, ?backoff, "timer recovery");
            tokio::time::sleep(backoff).await;
            if self.arm_timer(self.next_interval()).is_ok() {
                self.fields.clear(keys::TIMER_RECOVERY_FAILED);
                return;
            }
            if self.shutdown.is_cancelled() {
                return;
            }
        }
        error!(device_id = %self.device_id, "timer recovery exhausted");
        self.fields.set_bool(keys::TIMER_RECOVERY_FAILED, true, true);
    }

    /// Re-arm if the recorded timer is gone or stale.
    fn ensure_timer_active(&self) {
        let needs_arm = {
            let slot = self.timer.lock();
            match slot.as_ref() {
                Some(token) => scheduler::is_timer_stale(token.scheduled_at.elapsed()),
                None => true,
            }
        };
        if needs_arm {
            let interval = self.next_interval();
            if let Err(e) = self.arm_timer(interval) {
                warn!(device_id = %self.device_id, "ensure-active re-arm failed: {}", e);
            }
        }
    }

    /// Scheduled tick body.
    async fn tick(self: Arc<Self>) {
        // The record clears before any work so a crash mid-tick never
        // leaves a phantom armed timer behind.
        {
            let mut slot = self.timer.lock();
            *slot = None;
            self.fields.clear(keys::HEALTH_TIMER_ID);
            self.fields.clear(keys::LAST_HEALTH_SCHEDULED);
        }

        if self.is_polling.swap(true, Ordering::SeqCst) {
            debug!(device_id = %self.device_id, "tick skipped, poll in flight");
            self.arm_next_or_recover().await;
            return;
        }
        self.fields.set_bool(keys::IS_POLLING, true, false);

        self.run_poll().await;

        self.is_polling.store(false, Ordering::SeqCst);
        self.fields.set_bool(keys::IS_POLLING, false, false);
        self.arm_next_or_recover().await;
    }
}

/// Boxed tick future; boxing breaks the arm/tick type cycle.
fn tick_boxed(inner: Arc<Inner>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(Inner::tick(inner))
}

/// Content hash of a preference set, for change detection.
fn prefs_hash(prefs: &Preferences) -> Result<String> {
    let canonical = serde_json::to_string(prefs)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{:x}", digest))
}

/// Mirror the pieces of session memory the host wants to see (or that
/// must survive a restart) into the field store. Instants are converted
/// to epoch seconds relative to `now`. Best-effort by design.
fn mirror_memory(
    fields: &dyn DeviceFieldStore,
    mem: &SessionMemory,
    derived: &DerivedState,
    now: Instant,
) {
    let now_epoch = chrono::Utc::now().timestamp() as f64;
    let to_epoch = |instant: Instant| now_epoch - now.saturating_duration_since(instant).as_secs_f64();

    fields.set_bool(keys::PANIC_STATE, mem.panic_state, true);
    fields.set_u64(
        keys::CONSECUTIVE_AUTH_FAILURES,
        mem.consecutive_auth_failures as u64,
        true,
    );
    fields.set_bool(keys::SESSION_REACHED_TEMP, mem.session_reached_temp, true);
    fields.set_bool(
        keys::SESSION_EVER_REACHED_TEMP,
        mem.session_ever_reached_temp,
        true,
    );
    fields.set_bool(
        keys::IS_CONNECTED,
        matches!(derived.connectivity, Connectivity::Online),
        true,
    );

    match mem.last_target_temp {
        Some(t) => fields.set_u64(keys::LAST_TARGET_TEMP, t as u64, true),
        None => fields.clear(keys::LAST_TARGET_TEMP),
    }
    match mem.last_active_time {
        Some(t) => fields.set_f64(keys::LAST_ACTIVE_TIME, to_epoch(t), true),
        None => fields.clear(keys::LAST_ACTIVE_TIME),
    }
    match mem.grill_start_time {
        Some(t) => fields.set_f64(keys::GRILL_START_TIME, to_epoch(t), true),
        None => fields.clear(keys::GRILL_START_TIME),
    }
    match mem.first_offline_time {
        Some(t) => fields.set_f64(keys::FIRST_OFFLINE_TIME, to_epoch(t), true),
        None => fields.clear(keys::FIRST_OFFLINE_TIME),
    }
    if let Some(t) = mem.last_successful_check {
        fields.set_f64(keys::LAST_SUCCESSFUL_HEALTH_CHECK, to_epoch(t), true);
    }
    if let Some(status) = &derived.last_status {
        let unit = match status.unit {
            Unit::Fahrenheit => "F",
            Unit::Celsius => "C",
        };
        fields.set_string(keys::UNIT, unit, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthCache;
    use crate::fields::MemoryFieldStore;
    use crate::http::HttpClient;
    use crate::status::{Status, Temperature};

    fn controller() -> (GrillController, mpsc::UnboundedReceiver<StateUpdate>, Arc<MemoryFieldStore>) {
        let http = HttpClient::new().unwrap();
        let auth = Arc::new(AuthCache::new(http.clone()));
        let client = GrillClient::new(http, Arc::clone(&auth));
        let rediscovery = Arc::new(RediscoveryService::new(auth).unwrap());
        let fields = Arc::new(MemoryFieldStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = GrillController::new(
            "grill-1",
            Arc::clone(&fields) as Arc<dyn DeviceFieldStore>,
            client,
            rediscovery,
            Preferences::default(),
            tx,
        );
        (controller, rx, fields)
    }

    fn cooking_status() -> Status {
        Status {
            grill_temp: Temperature::Degrees(250),
            set_temp: Temperature::Degrees(250),
            module_on: true,
            motor_state: true,
            fan_state: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn apply_input_emits_and_mirrors() {
        let (controller, mut rx, fields) = controller();
        controller
            .inner
            .apply_input(ReduceInput::Fresh(cooking_status()));

        let update = rx.recv().await.unwrap();
        assert_eq!(update.device_id, "grill-1");
        assert_eq!(update.state.operation, Operation::AtTemp);
        assert_eq!(update.message_text, "Connected (At Temp)");

        assert_eq!(fields.get_bool(keys::IS_CONNECTED), Some(true));
        assert_eq!(fields.get_bool(keys::SESSION_REACHED_TEMP), Some(true));
        assert_eq!(fields.get_u64(keys::LAST_TARGET_TEMP), Some(250));
        assert_eq!(fields.get_string(keys::UNIT), Some("F".into()));
        assert!(fields.get_f64(keys::LAST_ACTIVE_TIME).is_some());
    }

    #[tokio::test]
    async fn offline_after_active_panics_and_speeds_up_polling() {
        let (controller, mut rx, fields) = controller();
        controller
            .inner
            .apply_input(ReduceInput::Fresh(cooking_status()));
        let _ = rx.recv().await;

        controller.inner.apply_input(ReduceInput::Offline);
        let update = rx.recv().await.unwrap();
        assert!(update.state.panic);
        assert_eq!(
            update.message_text,
            "PANIC: Lost Connection (Grill Was On!)"
        );
        assert_eq!(fields.get_bool(keys::PANIC_STATE), Some(true));
        assert!(fields.get_f64(keys::FIRST_OFFLINE_TIME).is_some());

        // Panic recovery polls at the clamped floor.
        controller.inner.first_after_setup.store(false, Ordering::SeqCst);
        let interval = controller.inner.next_interval();
        assert_eq!(interval, crate::config::MIN_HEALTH_CHECK_INTERVAL);
    }

    #[tokio::test]
    async fn first_interval_is_used_exactly_once() {
        let (controller, _rx, fields) = controller();
        fields.set_bool(keys::FIRST_HEALTH_CHECK_AFTER_SETUP, true, true);
        let first = controller.inner.next_interval();
        assert_eq!(first, scheduler::first_tick_interval(&Preferences::default()));
        assert_eq!(
            fields.get_bool(keys::FIRST_HEALTH_CHECK_AFTER_SETUP),
            Some(false)
        );
        // Second computation uses the steady-state policy (idle: 30s x 6).
        let second = controller.inner.next_interval();
        assert_eq!(second, Duration::from_secs(180));
    }

    #[tokio::test]
    async fn single_timer_invariant_on_rearm() {
        let (controller, _rx, fields) = controller();
        controller
            .inner
            .arm_timer(Duration::from_secs(600))
            .unwrap();
        let first_id = fields.get_u64(keys::HEALTH_TIMER_ID).unwrap();
        controller
            .inner
            .arm_timer(Duration::from_secs(600))
            .unwrap();
        let second_id = fields.get_u64(keys::HEALTH_TIMER_ID).unwrap();
        assert_ne!(first_id, second_id);
        // Exactly one live token regardless of how many times we arm.
        assert!(controller.inner.timer.lock().is_some());
        controller.remove().await;
        assert!(controller.inner.timer.lock().is_none());
    }

    #[tokio::test]
    async fn arming_after_removal_fails() {
        let (controller, _rx, _fields) = controller();
        controller.remove().await;
        let err = controller
            .inner
            .arm_timer(Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, Error::TimerArmFailed(_)));
    }

    #[tokio::test]
    async fn init_applies_the_short_interval_to_one_tick_only() {
        let (controller, _rx, fields) = controller();
        controller.init().await.unwrap();
        // The armed first tick consumed the flag, so the very next
        // computation is already steady-state (idle: 30s x 6).
        assert_eq!(
            fields.get_bool(keys::FIRST_HEALTH_CHECK_AFTER_SETUP),
            Some(false)
        );
        assert!(controller.inner.timer.lock().is_some());
        assert_eq!(controller.inner.next_interval(), Duration::from_secs(180));
        controller.remove().await;
    }

    #[tokio::test]
    async fn invalid_preferences_are_rejected_without_mutation() {
        let (controller, _rx, fields) = controller();
        let bad = Preferences {
            refresh_interval: 0,
            ..Default::default()
        };
        let err = controller.on_prefs_changed(bad).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(fields.get_string(keys::LAST_PROCESSED_PREFS), None);
        // The live preferences are untouched.
        assert_eq!(controller.inner.prefs.read().refresh_interval, 30);
    }

    #[tokio::test]
    async fn prefs_hash_short_circuits_repeats() {
        let (controller, _rx, fields) = controller();
        let prefs = Preferences {
            refresh_interval: 45,
            ..Default::default()
        };
        controller.on_prefs_changed(prefs.clone()).await.unwrap();
        let stored = fields.get_string(keys::LAST_PROCESSED_PREFS).unwrap();
        // Same content again: the stored hash is untouched and no error.
        controller.on_prefs_changed(prefs).await.unwrap();
        assert_eq!(fields.get_string(keys::LAST_PROCESSED_PREFS), Some(stored));
    }

    #[tokio::test]
    async fn temperature_commands_snap_and_validate() {
        let (controller, _rx, _fields) = controller();
        // Snapped before encoding: 237 becomes the nearest setpoint.
        let hex = controller
            .inner
            .encode_command(Command::SetTemperature(237))
            .unwrap();
        assert_eq!(hex, "FE0501020205FF"); // 225
        assert!(matches!(
            controller.inner.encode_command(Command::SetTemperature(600)),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(
            controller.inner.encode_command(Command::SetPower(false)).unwrap(),
            "FE0102FF"
        );
    }
}

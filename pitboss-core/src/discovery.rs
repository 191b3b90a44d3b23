// SPDX-License-Identifier: MIT
//
// Pit Boss LAN Controller
// https://github.com/pitboss-lan/pitboss-lan

//! Targeted subnet rediscovery for a grill that changed address
//!
//! DHCP reassignment is the usual reason a healthy grill goes dark. When
//! the user has opted in, the controller sweeps the hub's /24 with cheap
//! `Sys.GetInfo` probes, bounded to a small concurrent wave so a consumer
//! router is not flattened. Scans are rate-limited twice over (a short
//! cooldown tied to the refresh cadence and a 24-hour floor), cancellable
//! at every probe boundary, and resumable from where a deadline cut them
//! off.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AuthCache;
use crate::config::{
    Preferences, DEFAULT_SCAN_END_IP, DEFAULT_SCAN_START_IP, DISCOVERY_RETRY_DELAY,
    MAX_CONCURRENT_CONNECTIONS, PERIODIC_REDISCOVERY_INTERVAL, PROBE_TIMEOUT,
    REDISCOVERY_STALE_FLAG, REDISCOVERY_TIMEOUT, SCAN_DRAIN_TIMEOUT,
};
use crate::fields::{keys, DeviceFieldStore, FieldExt};
use crate::http::HttpClient;
use crate::rpc::{GrillClient, SystemInfo};
use crate::{Error, Result};

/// Outcome of one rediscovery request.
#[derive(Debug)]
pub enum RediscoveryOutcome {
    /// A matching grill answered at this address.
    Found { ip: String, info: SystemInfo },
    /// The whole range was swept without a match.
    NotFound,
    /// Rate-limited; nothing was attempted.
    RateLimited { retry_after: Duration },
    /// Another scan for this device is already in flight.
    AlreadyRunning,
    /// Deadline hit mid-sweep; the next attempt resumes at `resume_at`.
    TimedOut { resume_at: u8 },
}

/// Inputs to the dual rate limiter, all epoch seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitInputs {
    pub now: i64,
    pub last_attempt: Option<i64>,
    pub first_offline: Option<i64>,
    pub last_success: Option<i64>,
    pub refresh_interval_secs: u64,
}

/// Check both limiters; `Err` carries the remaining cooldown.
pub fn check_rate_limit(i: &RateLimitInputs) -> std::result::Result<(), Duration> {
    // Short cooldown: no more than one attempt per three refresh cycles.
    let cooldown = (3 * i.refresh_interval_secs) as i64;
    if let Some(last) = i.last_attempt {
        let since = i.now - last;
        if since < cooldown {
            return Err(Duration::from_secs((cooldown - since).max(0) as u64));
        }
    }

    // 24-hour floor, measured from when the device first went dark.
    let floor = PERIODIC_REDISCOVERY_INTERVAL.as_secs() as i64;
    let offline_for = match i.first_offline {
        Some(t) => i.now - t,
        None => return Err(Duration::from_secs(floor as u64)),
    };
    if offline_for < floor {
        return Err(Duration::from_secs((floor - offline_for).max(0) as u64));
    }
    if let Some(success) = i.last_success {
        let since = i.now - success;
        if since < floor {
            return Err(Duration::from_secs((floor - since).max(0) as u64));
        }
    }
    Ok(())
}

/// First three octets of the hub address, defining the /24 to sweep.
pub fn subnet_prefix(hub_ip: &str) -> Result<[u8; 3]> {
    let addr: Ipv4Addr = hub_ip
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("malformed hub IP: {:?}", hub_ip)))?;
    let o = addr.octets();
    Ok([o[0], o[1], o[2]])
}

/// Internal result of one sweep.
enum SweepResult {
    Found { ip: String, info: SystemInfo },
    Exhausted,
    Cancelled { resume_at: u8 },
}

/// Whether a responding device settles the scan.
///
/// A known network id only accepts the exact device. Without one, the
/// first Pit Boss wins. `scan_continue` keeps the sweep going past a
/// non-matching Pit Boss in the hope the right one is further along;
/// disabled, the first Pit Boss found is taken regardless.
fn accept_probe(info: &SystemInfo, expect_id: Option<&str>, scan_continue: bool) -> bool {
    if !info.is_pitboss() {
        return false;
    }
    match expect_id {
        None => true,
        Some(id) => info.id == id || !scan_continue,
    }
}

/// Rediscovery engine; one per process, shared by all controllers.
pub struct RediscoveryService {
    probe_client: GrillClient,
    /// Device ids with a scan in flight in this process.
    locks: Mutex<HashSet<String>>,
}

struct ScanLockGuard<'a> {
    locks: &'a Mutex<HashSet<String>>,
    device_id: String,
}

impl Drop for ScanLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.device_id);
    }
}

impl RediscoveryService {
    pub fn new(auth: Arc<AuthCache>) -> Result<Self> {
        let probe_client = GrillClient::new(HttpClient::with_timeout(PROBE_TIMEOUT)?, auth);
        Ok(Self {
            probe_client,
            locks: Mutex::new(HashSet::new()),
        })
    }

    /// Attempt to locate the grill on the hub's subnet.
    ///
    /// `bypass` skips both rate limiters (preference-change scans).
    pub async fn rediscover(
        &self,
        device_id: &str,
        fields: &dyn DeviceFieldStore,
        prefs: &Preferences,
        bypass: bool,
        cancel: &CancellationToken,
    ) -> Result<RediscoveryOutcome> {
        let now_epoch = chrono::Utc::now().timestamp();

        if !bypass {
            let inputs = RateLimitInputs {
                now: now_epoch,
                last_attempt: fields.get_f64(keys::LAST_REDISCOVERY_ATTEMPT).map(|v| v as i64),
                first_offline: fields.get_f64(keys::FIRST_OFFLINE_TIME).map(|v| v as i64),
                last_success: fields
                    .get_f64(keys::LAST_SUCCESSFUL_REDISCOVERY)
                    .map(|v| v as i64),
                refresh_interval_secs: prefs.refresh_interval,
            };
            if let Err(retry_after) = check_rate_limit(&inputs) {
                debug!(device_id, ?retry_after, "rediscovery rate-limited");
                return Ok(RediscoveryOutcome::RateLimited { retry_after });
            }
        }

        // Persisted in-progress flag guards against a crashed scan; a flag
        // older than the stale horizon is reclaimed.
        if fields.get_bool(keys::REDISCOVERY_IN_PROGRESS).unwrap_or(false) {
            let started = fields.get_f64(keys::REDISCOVERY_START_TIME).unwrap_or(0.0) as i64;
            if now_epoch - started <= REDISCOVERY_STALE_FLAG.as_secs() as i64 {
                return Ok(RediscoveryOutcome::AlreadyRunning);
            }
            warn!(device_id, "stale rediscovery flag reclaimed");
        }

        let _guard = {
            let mut locks = self.locks.lock();
            if !locks.insert(device_id.to_string()) {
                return Ok(RediscoveryOutcome::AlreadyRunning);
            }
            ScanLockGuard { locks: &self.locks, device_id: device_id.to_string() }
        };

        let subnet = subnet_prefix(&prefs.hub_ip)?;

        fields.set_bool(keys::REDISCOVERY_IN_PROGRESS, true, true);
        fields.set_f64(keys::REDISCOVERY_START_TIME, now_epoch as f64, true);
        fields.set_f64(keys::LAST_REDISCOVERY_ATTEMPT, now_epoch as f64, true);

        let resume_at = fields
            .get_u64(keys::LAST_SCAN_POSITION)
            .and_then(|v| u8::try_from(v).ok())
            .filter(|&v| (DEFAULT_SCAN_START_IP..=DEFAULT_SCAN_END_IP).contains(&v))
            .unwrap_or(DEFAULT_SCAN_START_IP);
        let expect_id = fields.get_string(keys::DEVICE_NETWORK_ID);

        info!(device_id, subnet = ?subnet, resume_at, "starting subnet sweep");
        let result = self
            .sweep(subnet, resume_at, expect_id.as_deref(), prefs.scan_continue, cancel)
            .await;

        fields.set_bool(keys::REDISCOVERY_IN_PROGRESS, false, true);
        match result {
            SweepResult::Found { ip, info } => {
                info!(device_id, %ip, "grill rediscovered");
                fields.clear(keys::LAST_SCAN_POSITION);
                fields.set_f64(
                    keys::LAST_SUCCESSFUL_REDISCOVERY,
                    chrono::Utc::now().timestamp() as f64,
                    true,
                );
                Ok(RediscoveryOutcome::Found { ip, info })
            }
            SweepResult::Exhausted => {
                fields.clear(keys::LAST_SCAN_POSITION);
                // Let straggling sockets wind down before reporting the miss.
                tokio::time::sleep(DISCOVERY_RETRY_DELAY).await;
                Ok(RediscoveryOutcome::NotFound)
            }
            SweepResult::Cancelled { resume_at } => {
                fields.set_u64(keys::LAST_SCAN_POSITION, resume_at as u64, true);
                Ok(RediscoveryOutcome::TimedOut { resume_at })
            }
        }
    }

    /// Sweep the range in bounded waves, honouring the deadline between
    /// probe waves. Each probe carries its own short timeout, so a wave
    /// drains within [`PROBE_TIMEOUT`] of the deadline firing.
    async fn sweep(
        &self,
        subnet: [u8; 3],
        start_at: u8,
        expect_id: Option<&str>,
        scan_continue: bool,
        cancel: &CancellationToken,
    ) -> SweepResult {
        let deadline = Instant::now() + REDISCOVERY_TIMEOUT;
        let hosts: Vec<u8> = (start_at..=DEFAULT_SCAN_END_IP).collect();

        for wave in hosts.chunks(MAX_CONCURRENT_CONNECTIONS) {
            if cancel.is_cancelled() || Instant::now() >= deadline {
                return SweepResult::Cancelled { resume_at: wave[0] };
            }

            let handles: Vec<(u8, JoinHandle<Option<SystemInfo>>)> = wave
                .iter()
                .map(|&host| {
                    let ip = Ipv4Addr::new(subnet[0], subnet[1], subnet[2], host).to_string();
                    let client = self.probe_client.clone();
                    let handle =
                        tokio::spawn(async move { client.get_system_info(&ip).await.ok() });
                    (host, handle)
                })
                .collect();

            for (host, handle) in handles {
                // Past the deadline, outstanding probes get a short drain
                // window instead of an open-ended join.
                let joined = if cancel.is_cancelled() || Instant::now() >= deadline {
                    match tokio::time::timeout(SCAN_DRAIN_TIMEOUT, handle).await {
                        Ok(joined) => joined,
                        Err(_) => continue,
                    }
                } else {
                    handle.await
                };
                // A panicked probe never cancels the sweep.
                let info = match joined {
                    Ok(Some(info)) => info,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(host, "probe task failed: {}", e);
                        continue;
                    }
                };
                if accept_probe(&info, expect_id, scan_continue) {
                    let ip = Ipv4Addr::new(subnet[0], subnet[1], subnet[2], host).to_string();
                    return SweepResult::Found { ip, info };
                }
                debug!(host, id = %info.id, "responder did not match");
            }
        }
        SweepResult::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, app: &str) -> SystemInfo {
        SystemInfo {
            id: id.into(),
            app: app.into(),
            fw: None,
            hw: None,
        }
    }

    #[test]
    fn subnet_from_hub_ip() {
        assert_eq!(subnet_prefix("192.168.1.10").unwrap(), [192, 168, 1]);
        assert!(matches!(subnet_prefix("not-an-ip"), Err(Error::InvalidArgument(_))));
        assert!(matches!(subnet_prefix(""), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn short_cooldown_rejects_rapid_retries() {
        let inputs = RateLimitInputs {
            now: 10_000,
            last_attempt: Some(10_000 - 60),
            first_offline: Some(0),
            last_success: None,
            refresh_interval_secs: 30,
        };
        // 3 x 30s cooldown, 60s elapsed: 30s remain.
        assert_eq!(check_rate_limit(&inputs), Err(Duration::from_secs(30)));
    }

    #[test]
    fn daily_floor_measured_from_first_offline() {
        let day = PERIODIC_REDISCOVERY_INTERVAL.as_secs() as i64;
        let mut inputs = RateLimitInputs {
            now: 200_000,
            last_attempt: None,
            first_offline: Some(200_000 - 3600),
            last_success: None,
            refresh_interval_secs: 30,
        };
        // Offline only an hour: the floor rejects with the remainder.
        assert_eq!(
            check_rate_limit(&inputs),
            Err(Duration::from_secs((day - 3600) as u64))
        );

        inputs.first_offline = Some(200_000 - day - 1);
        assert_eq!(check_rate_limit(&inputs), Ok(()));
    }

    #[test]
    fn recent_successful_rediscovery_also_blocks() {
        let day = PERIODIC_REDISCOVERY_INTERVAL.as_secs() as i64;
        let inputs = RateLimitInputs {
            now: 500_000,
            last_attempt: None,
            first_offline: Some(500_000 - day - 10),
            last_success: Some(500_000 - 100),
            refresh_interval_secs: 30,
        };
        assert!(check_rate_limit(&inputs).is_err());
    }

    #[test]
    fn never_offline_never_scans() {
        let inputs = RateLimitInputs {
            now: 500,
            refresh_interval_secs: 30,
            ..Default::default()
        };
        assert!(check_rate_limit(&inputs).is_err());
    }

    #[test]
    fn probe_acceptance_rules() {
        let pitboss = info("abc123", "PitBoss");
        let other = info("abc123", "Toaster");

        // No expected id: any Pit Boss is taken.
        assert!(accept_probe(&pitboss, None, true));
        assert!(!accept_probe(&other, None, true));

        // Known id must match while scan_continue holds.
        assert!(accept_probe(&pitboss, Some("abc123"), true));
        assert!(!accept_probe(&pitboss, Some("zzz"), true));

        // With scan_continue off, the first Pit Boss wins regardless.
        assert!(accept_probe(&pitboss, Some("zzz"), false));
        assert!(!accept_probe(&other, Some("zzz"), false));
    }
}

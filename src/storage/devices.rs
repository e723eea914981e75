//! Per-user device history.
//!
//! A device is a `(remote IP, client name)` pair observed for a user. Every
//! stats collection round feeds the merged per-user view in here; devices
//! that stop showing up are first flagged inactive and eventually purged.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::Serialize;

use crate::configuration::DeviceHistoryConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub remote_ip: String,
    pub client_name: String,
    pub user_agent: String,
    pub protocol: String,
    pub tls_fingerprint: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub first_seen: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_seen: DateTime<Utc>,
    /// Sum of every usage delta attributed to this device.
    pub total_usage: u64,
    pub uplink: u64,
    pub downlink: u64,
    pub is_active: bool,
}

/// One sighting of a user's device, as produced by the stats aggregator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceReport {
    pub remote_ip: String,
    pub client_name: String,
    pub user_agent: String,
    pub protocol: String,
    pub tls_fingerprint: String,
    pub uplink: Option<u64>,
    pub downlink: Option<u64>,
    /// The user's cumulative usage at the time of the report.
    pub cumulative_usage: u64,
}

/// Usage consumed since the previous report, clamped at zero so that a
/// counter reset never produces a negative delta.
pub fn usage_delta(previous: u64, current: u64) -> u64 {
    current.saturating_sub(previous)
}

/// Result of one aging pass over the device history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub marked_inactive: usize,
    pub purged: usize,
    /// Users whose last device was purged, in ascending order.
    pub forgotten_users: Vec<u32>,
}

type DeviceKey = (String, String);

#[derive(Debug, Default)]
struct DeviceBook {
    devices: HashMap<u32, HashMap<DeviceKey, DeviceRecord>>,
    last_usage: HashMap<u32, u64>,
}

pub struct DeviceStorage {
    book: Mutex<DeviceBook>,
    inactivity_timeout: Duration,
    max_age: Duration,
}

impl DeviceStorage {
    pub fn new(inactivity_timeout: Duration, max_age: Duration) -> Self {
        Self {
            book: Mutex::new(DeviceBook::default()),
            inactivity_timeout,
            max_age,
        }
    }

    pub fn from_config(config: &DeviceHistoryConfig) -> Self {
        Self::new(
            Duration::seconds(config.inactivity_timeout_secs as i64),
            Duration::seconds(config.max_age_secs as i64),
        )
    }

    fn book(&self) -> MutexGuard<'_, DeviceBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a sighting and returns the usage delta credited to the device.
    pub fn update_device(&self, uid: u32, report: DeviceReport) -> u64 {
        self.update_device_at(uid, report, Utc::now())
    }

    pub fn update_device_at(&self, uid: u32, report: DeviceReport, now: DateTime<Utc>) -> u64 {
        let mut book = self.book();

        let previous = book.last_usage.get(&uid).copied().unwrap_or(0);
        let delta = usage_delta(previous, report.cumulative_usage);
        book.last_usage.insert(uid, report.cumulative_usage);

        let key = (report.remote_ip.clone(), report.client_name.clone());
        let devices = book.devices.entry(uid).or_default();
        match devices.get_mut(&key) {
            Some(device) => {
                device.last_seen = now.max(device.first_seen);
                device.is_active = true;
                device.total_usage = device.total_usage.saturating_add(delta);
                overwrite_if_present(&mut device.user_agent, report.user_agent);
                overwrite_if_present(&mut device.protocol, report.protocol);
                overwrite_if_present(&mut device.tls_fingerprint, report.tls_fingerprint);
                if let Some(uplink) = report.uplink {
                    device.uplink = uplink;
                }
                if let Some(downlink) = report.downlink {
                    device.downlink = downlink;
                }
                debug!(
                    "Updated device {}:{} for user {} (delta={}, total={})",
                    key.0, key.1, uid, delta, device.total_usage
                );
            }
            None => {
                info!("New device for user {}: {}:{}", uid, key.0, key.1);
                devices.insert(
                    key,
                    DeviceRecord {
                        remote_ip: report.remote_ip,
                        client_name: report.client_name,
                        user_agent: report.user_agent,
                        protocol: report.protocol,
                        tls_fingerprint: report.tls_fingerprint,
                        first_seen: now,
                        last_seen: now,
                        total_usage: delta,
                        uplink: report.uplink.unwrap_or(0),
                        downlink: report.downlink.unwrap_or(0),
                        is_active: true,
                    },
                );
            }
        }
        delta
    }

    /// Flags devices not seen within the inactivity timeout. Returns how many changed.
    pub fn mark_inactive_devices_at(&self, now: DateTime<Utc>) -> usize {
        let mut marked = 0;
        for (uid, devices) in self.book().devices.iter_mut() {
            for device in devices.values_mut() {
                if device.is_active && now - device.last_seen > self.inactivity_timeout {
                    device.is_active = false;
                    marked += 1;
                    debug!(
                        "Device {}:{} for user {} marked as inactive",
                        device.remote_ip, device.client_name, uid
                    );
                }
            }
        }
        marked
    }

    /// Forgets devices older than the max age, and users left without devices
    /// along with their usage baseline. Returns the purge count and the
    /// forgotten users.
    pub fn cleanup_old_devices_at(&self, now: DateTime<Utc>) -> (usize, Vec<u32>) {
        let mut book = self.book();
        let mut removed = 0;
        let mut forgotten = Vec::new();
        book.devices.retain(|uid, devices| {
            let before = devices.len();
            devices.retain(|_, device| now - device.last_seen <= self.max_age);
            removed += before - devices.len();
            if devices.is_empty() {
                forgotten.push(*uid);
                return false;
            }
            true
        });
        let DeviceBook {
            devices,
            last_usage,
        } = &mut *book;
        last_usage.retain(|uid, _| devices.contains_key(uid));
        if removed > 0 {
            info!(
                "Cleaned up {} old device(s), {} user(s) forgotten",
                removed,
                forgotten.len()
            );
        }
        forgotten.sort_unstable();
        (removed, forgotten)
    }

    /// Runs both aging passes.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepOutcome {
        let marked_inactive = self.mark_inactive_devices_at(now);
        let (purged, forgotten_users) = self.cleanup_old_devices_at(now);
        SweepOutcome {
            marked_inactive,
            purged,
            forgotten_users,
        }
    }

    /// Drops the usage baseline of a user so that the next report counts from zero.
    pub fn reset_usage(&self, uid: u32) {
        self.book().last_usage.remove(&uid);
    }

    /// Devices of one user, most recently seen first.
    pub fn get_user_devices(&self, uid: u32, active_only: bool) -> Vec<DeviceRecord> {
        let book = self.book();
        let mut devices: Vec<DeviceRecord> = book
            .devices
            .get(&uid)
            .map(|d| {
                d.values()
                    .filter(|device| !active_only || device.is_active)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        devices
    }

    pub fn get_all_devices(&self) -> BTreeMap<u32, Vec<DeviceRecord>> {
        let uids: Vec<u32> = self.book().devices.keys().copied().collect();
        uids.into_iter()
            .map(|uid| (uid, self.get_user_devices(uid, false)))
            .collect()
    }
}

fn overwrite_if_present(field: &mut String, value: String) {
    if !value.is_empty() {
        *field = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> DeviceStorage {
        DeviceStorage::new(Duration::seconds(300), Duration::days(7))
    }

    fn report(ip: &str, client: &str, usage: u64) -> DeviceReport {
        DeviceReport {
            remote_ip: ip.to_string(),
            client_name: client.to_string(),
            cumulative_usage: usage,
            ..Default::default()
        }
    }

    #[test]
    fn test_usage_delta_clamps_counter_reset() {
        assert_eq!(usage_delta(100, 80), 0);
        assert_eq!(usage_delta(100, 150), 50);
        assert_eq!(usage_delta(0, 0), 0);
    }

    #[test]
    fn test_counter_reset_does_not_decrease_usage() {
        let devices = storage();
        let now = Utc::now();
        assert_eq!(devices.update_device_at(1, report("1.1.1.1", "xray", 100), now), 100);
        assert_eq!(devices.update_device_at(1, report("1.1.1.1", "xray", 80), now), 0);
        assert_eq!(devices.update_device_at(1, report("1.1.1.1", "xray", 90), now), 10);

        let list = devices.get_user_devices(1, false);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].total_usage, 110);
    }

    #[test]
    fn test_devices_keyed_by_ip_and_client() {
        let devices = storage();
        let now = Utc::now();
        devices.update_device_at(1, report("1.1.1.1", "xray", 10), now);
        devices.update_device_at(1, report("2.2.2.2", "xray", 20), now + Duration::seconds(1));
        devices.update_device_at(1, report("1.1.1.1", "other", 30), now + Duration::seconds(2));

        let list = devices.get_user_devices(1, false);
        assert_eq!(list.len(), 3);
        // most recent first
        assert_eq!(list[0].client_name, "other");
        assert_eq!(list[2].remote_ip, "1.1.1.1");
        assert_eq!(list[2].client_name, "xray");
    }

    #[test]
    fn test_update_keeps_first_seen_and_fills_fields() {
        let devices = storage();
        let t0 = Utc::now();
        devices.update_device_at(7, report("1.1.1.1", "xray", 0), t0);

        let mut second = report("1.1.1.1", "xray", 5);
        second.user_agent = "v2rayN".to_string();
        second.uplink = Some(3);
        devices.update_device_at(7, second, t0 + Duration::seconds(30));

        let mut third = report("1.1.1.1", "xray", 5);
        third.user_agent = String::new();
        devices.update_device_at(7, third, t0 + Duration::seconds(60));

        let device = &devices.get_user_devices(7, false)[0];
        assert_eq!(device.first_seen, t0);
        assert_eq!(device.last_seen, t0 + Duration::seconds(60));
        assert!(device.first_seen <= device.last_seen);
        assert_eq!(device.user_agent, "v2rayN");
        assert_eq!(device.uplink, 3);
        assert_eq!(device.total_usage, 5);
    }

    #[test]
    fn test_mark_inactive_then_reactivate() {
        let devices = storage();
        let t0 = Utc::now();
        devices.update_device_at(1, report("1.1.1.1", "xray", 0), t0);

        assert_eq!(devices.mark_inactive_devices_at(t0 + Duration::seconds(100)), 0);
        assert_eq!(devices.mark_inactive_devices_at(t0 + Duration::seconds(301)), 1);
        assert!(devices.get_user_devices(1, true).is_empty());
        assert_eq!(devices.get_user_devices(1, false).len(), 1);

        devices.update_device_at(1, report("1.1.1.1", "xray", 0), t0 + Duration::seconds(400));
        assert_eq!(devices.get_user_devices(1, true).len(), 1);
    }

    #[test]
    fn test_cleanup_drops_empty_users() {
        let devices = storage();
        let t0 = Utc::now();
        devices.update_device_at(1, report("1.1.1.1", "xray", 0), t0);
        devices.update_device_at(2, report("2.2.2.2", "xray", 0), t0);
        devices.update_device_at(2, report("3.3.3.3", "xray", 0), t0 + Duration::days(6));

        let (removed, forgotten) =
            devices.cleanup_old_devices_at(t0 + Duration::days(7) + Duration::seconds(1));
        assert_eq!(removed, 2);
        assert_eq!(forgotten, vec![1]);

        let all = devices.get_all_devices();
        assert!(!all.contains_key(&1));
        assert_eq!(all[&2].len(), 1);
        assert_eq!(all[&2][0].remote_ip, "3.3.3.3");
    }

    #[test]
    fn test_forgotten_user_restarts_usage_from_zero() {
        let devices = storage();
        let t0 = Utc::now();
        devices.update_device_at(1, report("1.1.1.1", "xray", 500), t0);

        let outcome = devices.sweep_at(t0 + Duration::days(8));
        assert_eq!(outcome.purged, 1);
        assert_eq!(outcome.forgotten_users, vec![1]);

        // No stale baseline: the whole report counts again.
        let t1 = t0 + Duration::days(9);
        assert_eq!(devices.update_device_at(1, report("1.1.1.1", "xray", 40), t1), 40);
        assert_eq!(devices.get_user_devices(1, false)[0].total_usage, 40);
    }

    #[test]
    fn test_reset_usage_drops_the_baseline() {
        let devices = storage();
        let t0 = Utc::now();
        assert_eq!(devices.update_device_at(3, report("1.1.1.1", "xray", 100), t0), 100);
        assert_eq!(devices.update_device_at(3, report("1.1.1.1", "xray", 130), t0), 30);

        devices.reset_usage(3);
        assert_eq!(devices.update_device_at(3, report("1.1.1.1", "xray", 20), t0), 20);
        assert_eq!(devices.get_user_devices(3, false)[0].total_usage, 150);
    }
}

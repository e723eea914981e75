use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use log::{debug, trace};

use super::access_log::parse_access_line;
use crate::configuration::MetaCacheConfig;

#[derive(Debug, Clone)]
struct MetaEntry {
    remote_ip: String,
    last_updated: DateTime<Utc>,
    /// Write order, breaks ties between equal timestamps.
    seq: u64,
}

#[derive(Debug)]
struct CacheState {
    entries: HashMap<u32, MetaEntry>,
    last_cleanup: DateTime<Utc>,
    next_seq: u64,
}

/// Last known remote IP per user, as seen in the core's access log.
///
/// This is an approximation: it reflects whichever line was parsed last for
/// a user and silently goes stale. Entries expire after `ttl`; the map never
/// holds more than `capacity` users, the oldest being dropped first.
pub struct ConnectionMetaCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    capacity: usize,
    cleanup_interval: Duration,
}

impl ConnectionMetaCache {
    pub fn new(ttl: Duration, capacity: usize, cleanup_interval: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                last_cleanup: Utc::now(),
                next_seq: 0,
            }),
            ttl,
            capacity,
            cleanup_interval,
        }
    }

    pub fn from_config(config: &MetaCacheConfig) -> Self {
        Self::new(
            Duration::seconds(config.ttl_secs as i64),
            config.capacity,
            Duration::seconds(config.cleanup_interval_secs as i64),
        )
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds one log line. Returns whether it updated the cache.
    pub fn handle_line(&self, line: &str) -> bool {
        match parse_access_line(line) {
            Some(record) => {
                trace!(
                    "Captured IP {} for user {} from access log",
                    record.remote_ip,
                    record.user_id
                );
                self.record(record.user_id, record.remote_ip);
                true
            }
            None => false,
        }
    }

    pub fn record(&self, user_id: u32, remote_ip: String) {
        self.record_at(user_id, remote_ip, Utc::now());
    }

    pub fn record_at(&self, user_id: u32, remote_ip: String, now: DateTime<Utc>) {
        let mut state = self.state();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            user_id,
            MetaEntry {
                remote_ip,
                last_updated: now,
                seq,
            },
        );

        if state.entries.len() > self.capacity || now - state.last_cleanup > self.cleanup_interval
        {
            self.cleanup(&mut state, now);
        }
    }

    /// Runs an eviction pass regardless of when the last one happened.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state();
        self.cleanup(&mut state, now)
    }

    fn cleanup(&self, state: &mut CacheState, now: DateTime<Utc>) -> usize {
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| now - entry.last_updated <= self.ttl);

        if state.entries.len() > self.capacity {
            let mut by_age: Vec<(DateTime<Utc>, u64, u32)> = state
                .entries
                .iter()
                .map(|(uid, entry)| (entry.last_updated, entry.seq, *uid))
                .collect();
            by_age.sort_unstable();
            let excess = state.entries.len() - self.capacity;
            for (_, _, uid) in by_age.into_iter().take(excess) {
                state.entries.remove(&uid);
            }
        }

        state.last_cleanup = now;
        let evicted = before - state.entries.len();
        if evicted > 0 {
            debug!(
                "Evicted {} connection metadata entr{}, {} left",
                evicted,
                if evicted == 1 { "y" } else { "ies" },
                state.entries.len()
            );
        }
        evicted
    }

    /// Snapshot of the remote IP per user id.
    pub fn get_last_meta(&self) -> HashMap<u32, String> {
        self.state()
            .entries
            .iter()
            .map(|(uid, entry)| (*uid, entry.remote_ip.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn last_updated(&self, user_id: u32) -> Option<DateTime<Utc>> {
        self.state().entries.get(&user_id).map(|e| e.last_updated)
    }
}

impl Default for ConnectionMetaCache {
    fn default() -> Self {
        Self::from_config(&MetaCacheConfig::default())
    }
}

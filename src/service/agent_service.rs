use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream, StreamExt};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use super::types::{
    BackendConfigReply, BackendInfo, BackendStats, InboundInfo, UserDelta, UserDevices, UserStats,
};
use crate::backends::{Backend, UserMeta};
use crate::error_handling::types::ServiceError;
use crate::storage::types::{Inbound, User};
use crate::storage::{DeviceReport, DeviceStorage, Storage, SweepOutcome};

/// Transport-independent implementation of the controller-facing RPCs.
///
/// # Fields Overview
///
/// - `storage`: the user/inbound catalog reconciled against
/// - `backends`: registered backends, in registration order; that order is
///   the precedence order when merging descriptive fields
/// - `devices`: device history fed by every stats collection
/// - `lifetime_usage`: per-user sum of every usage figure reported since the
///   user was last removed or forgotten by the device history
pub struct AgentService {
    storage: Arc<dyn Storage>,
    backends: Vec<(String, Arc<dyn Backend>)>,
    devices: Arc<DeviceStorage>,
    lifetime_usage: Mutex<HashMap<u32, u64>>,
}

impl AgentService {
    pub fn new(
        storage: Arc<dyn Storage>,
        backends: Vec<(String, Arc<dyn Backend>)>,
        devices: Arc<DeviceStorage>,
    ) -> Self {
        Self {
            storage,
            backends,
            devices,
            lifetime_usage: Mutex::new(HashMap::new()),
        }
    }

    fn backend(&self, name: &str) -> Result<&Arc<dyn Backend>, ServiceError> {
        self.backends
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, backend)| backend)
            .ok_or_else(|| ServiceError::BackendNotFound(name.to_string()))
    }

    fn resolve_tag(&self, tag: &str) -> Result<&Arc<dyn Backend>, ServiceError> {
        self.backends
            .iter()
            .find(|(_, backend)| backend.contains_tag(tag))
            .map(|(_, backend)| backend)
            .ok_or_else(|| ServiceError::InboundNotFound(tag.to_string()))
    }

    async fn add_user(&self, user: &User, inbounds: &[Inbound]) -> Result<(), ServiceError> {
        for inbound in inbounds {
            let backend = self.resolve_tag(&inbound.tag)?;
            debug!("Adding user `{}` to inbound `{}`", user.username, inbound.tag);
            backend.add_user(user, inbound).await?;
        }
        Ok(())
    }

    async fn remove_user(&self, user: &User, inbounds: &[Inbound]) -> Result<(), ServiceError> {
        for inbound in inbounds {
            let backend = self.resolve_tag(&inbound.tag)?;
            debug!(
                "Removing user `{}` from inbound `{}`",
                user.username, inbound.tag
            );
            backend.remove_user(user, inbound).await?;
        }
        Ok(())
    }

    /// Moves the stored membership of one user to the desired one.
    pub async fn sync_user(&self, delta: UserDelta) -> Result<(), ServiceError> {
        let desired_tags = dedup_tags(&delta.inbound_tags);
        let stored = self.storage.get_user(delta.user.id);

        let stored = match (stored, desired_tags.is_empty()) {
            (None, true) => {
                debug!("User {} is unknown and has no inbounds, nothing to do", delta.user.id);
                return Ok(());
            }
            (None, false) => {
                let inbounds = self.storage.list_inbounds(Some(desired_tags.as_slice()));
                self.add_user(&delta.user, &inbounds).await?;
                self.storage.update_user_inbounds(&delta.user, &inbounds)?;
                info!(
                    "User {} added to {} inbound(s)",
                    delta.user.id,
                    inbounds.len()
                );
                return Ok(());
            }
            (Some(stored), true) => {
                self.remove_user(&stored.user, &stored.inbounds).await?;
                self.storage.remove_user(stored.user.id)?;
                self.forget_usage(stored.user.id);
                info!("User {} removed", stored.user.id);
                return Ok(());
            }
            (Some(stored), false) => stored,
        };

        let stored_tags: HashSet<String> = stored.tags().map(str::to_string).collect();
        let desired_set: HashSet<String> = desired_tags.iter().cloned().collect();
        let added: Vec<String> = desired_tags
            .iter()
            .filter(|tag| !stored_tags.contains(*tag))
            .cloned()
            .collect();
        let removed: Vec<String> = stored_tags.difference(&desired_set).cloned().collect();

        let removed_inbounds: Vec<Inbound> = stored
            .inbounds
            .iter()
            .filter(|i| removed.contains(&i.tag))
            .cloned()
            .collect();
        let added_inbounds = self.storage.list_inbounds(Some(added.as_slice()));

        self.remove_user(&stored.user, &removed_inbounds).await?;
        self.add_user(&stored.user, &added_inbounds).await?;

        let desired = self.storage.list_inbounds(Some(desired_tags.as_slice()));
        self.storage.update_user_inbounds(&stored.user, &desired)?;
        debug!(
            "User {} synced: +{} -{}",
            stored.user.id,
            added_inbounds.len(),
            removed_inbounds.len()
        );
        Ok(())
    }

    /// `SyncUsers`: applies deltas in arrival order. Returns how many were applied.
    pub async fn sync_users<S>(&self, deltas: S) -> Result<usize, ServiceError>
    where
        S: Stream<Item = UserDelta> + Unpin,
    {
        let mut deltas = deltas;
        let mut applied = 0;
        while let Some(delta) = deltas.next().await {
            self.sync_user(delta).await?;
            applied += 1;
        }
        Ok(applied)
    }

    /// `RepopulateUsers`: full-state replace.
    pub async fn repopulate_users(&self, deltas: Vec<UserDelta>) -> Result<(), ServiceError> {
        let wanted: HashSet<u32> = deltas.iter().map(|d| d.user.id).collect();
        for delta in deltas {
            self.sync_user(delta).await?;
        }
        for stored in self.storage.list_users() {
            if !wanted.contains(&stored.user.id) {
                self.remove_user(&stored.user, &stored.inbounds).await?;
                self.storage.remove_user(stored.user.id)?;
                self.forget_usage(stored.user.id);
                info!("User {} dropped during repopulation", stored.user.id);
            }
        }
        Ok(())
    }

    /// `FetchUsersStats`: merged per-user usage and metadata.
    ///
    /// Each backend is queried in isolation; a failing backend is logged and
    /// left out. Usage figures are summed; descriptive fields keep the first
    /// non-empty value in backend order.
    pub async fn fetch_users_stats(&self) -> Vec<UserStats> {
        let mut total_usage: BTreeMap<u32, u64> = BTreeMap::new();
        let mut merged: HashMap<u32, UserMeta> = HashMap::new();

        for (name, backend) in &self.backends {
            // Metadata first: its counters are read without reset.
            if let Some(source) = backend.users_meta() {
                match source.get_users_meta().await {
                    Ok(meta) => {
                        for (uid, info) in meta {
                            merge_meta(merged.entry(uid).or_default(), info, name);
                        }
                    }
                    Err(e) => warn!("Failed to get metadata from backend {}: {}", name, e),
                }
            }

            match backend.get_usages(true).await {
                Ok(usages) => {
                    for (uid, usage) in usages {
                        let total = total_usage.entry(uid).or_default();
                        *total = total.saturating_add(usage);
                    }
                }
                Err(e) => warn!("Failed to get usages from backend {}: {}", name, e),
            }
        }

        let stats: Vec<UserStats> = total_usage
            .into_iter()
            .map(|(uid, usage)| {
                let info = merged.remove(&uid).unwrap_or_default();
                UserStats {
                    uid,
                    usage,
                    uplink: info.uplink,
                    downlink: info.downlink,
                    remote_ip: info.remote_ip,
                    client_name: info.client_name,
                    user_agent: info.user_agent,
                    protocol: info.protocol,
                    tls_fingerprint: info.tls_fingerprint,
                }
            })
            .collect();

        self.record_devices(&stats);
        debug!("Collected stats for {} user(s)", stats.len());
        stats
    }

    fn lifetime(&self) -> MutexGuard<'_, HashMap<u32, u64>> {
        self.lifetime_usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub(super) fn lifetime_usage_of(&self, uid: u32) -> Option<u64> {
        self.lifetime().get(&uid).copied()
    }

    /// Drops the usage totals of a user no longer served.
    fn forget_usage(&self, uid: u32) {
        self.lifetime().remove(&uid);
        self.devices.reset_usage(uid);
    }

    fn record_devices(&self, stats: &[UserStats]) {
        let mut lifetime = self.lifetime();
        for stat in stats {
            let total = lifetime.entry(stat.uid).or_default();
            *total = total.saturating_add(stat.usage);
            if stat.remote_ip.is_empty() {
                continue;
            }
            self.devices.update_device(
                stat.uid,
                DeviceReport {
                    remote_ip: stat.remote_ip.clone(),
                    client_name: stat.client_name.clone(),
                    user_agent: stat.user_agent.clone(),
                    protocol: stat.protocol.clone(),
                    tls_fingerprint: stat.tls_fingerprint.clone(),
                    uplink: Some(stat.uplink),
                    downlink: Some(stat.downlink),
                    cumulative_usage: *total,
                },
            );
        }
    }

    /// `FetchBackends`.
    pub async fn fetch_backends(&self) -> Vec<BackendInfo> {
        self.backends
            .iter()
            .map(|(name, backend)| BackendInfo {
                name: name.clone(),
                backend_type: backend.backend_type().to_string(),
                version: backend.version(),
                inbounds: backend
                    .list_inbounds()
                    .into_iter()
                    .map(|i| InboundInfo {
                        config: i.config.to_string(),
                        tag: i.tag,
                    })
                    .collect(),
            })
            .collect()
    }

    /// `StreamBackendLogs`: the trailing buffer if asked for, then live lines
    /// until the core exits or the caller drops the stream.
    pub fn stream_backend_logs(
        &self,
        name: &str,
        include_buffer: bool,
    ) -> Result<impl Stream<Item = String> + Send + 'static, ServiceError> {
        let (buffer, live) = self.backend(name)?.logs(include_buffer);
        let live = stream::unfold(live, |mut rx| async move {
            rx.recv().await.map(|line| (line, rx))
        });
        Ok(stream::iter(buffer).chain(live))
    }

    /// `GetBackendStats`.
    pub async fn get_backend_stats(&self, name: &str) -> Result<BackendStats, ServiceError> {
        let backend = self.backend(name)?;
        Ok(BackendStats {
            running: backend.running().await,
        })
    }

    /// `FetchBackendConfig`.
    pub fn fetch_backend_config(&self, name: &str) -> Result<BackendConfigReply, ServiceError> {
        let backend = self.backend(name)?;
        Ok(BackendConfigReply {
            configuration: backend.get_config()?,
            config_format: backend.config_format(),
        })
    }

    /// `RestartBackend`. An empty configuration counts as none.
    pub async fn restart_backend(
        &self,
        name: &str,
        config: Option<String>,
    ) -> Result<(), ServiceError> {
        let backend = self.backend(name)?;
        let config = config.filter(|c| !c.trim().is_empty());
        backend.restart(config).await?;
        Ok(())
    }

    /// `FetchUserDevices`.
    pub fn fetch_user_devices(&self, uid: u32, active_only: bool) -> UserDevices {
        UserDevices {
            uid,
            devices: self.devices.get_user_devices(uid, active_only),
        }
    }

    /// `FetchAllDevices`.
    pub fn fetch_all_devices(&self) -> Vec<UserDevices> {
        self.devices
            .get_all_devices()
            .into_iter()
            .map(|(uid, devices)| UserDevices { uid, devices })
            .collect()
    }

    /// Periodically ages the device history until `cancel` fires.
    pub async fn run_device_sweeper(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Device sweeper cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep_devices_at(Utc::now());
                }
            }
        }
    }

    /// One aging pass over the device history. Lifetime totals of forgotten
    /// users go with them.
    pub fn sweep_devices_at(&self, now: DateTime<Utc>) -> SweepOutcome {
        let outcome = self.devices.sweep_at(now);
        if !outcome.forgotten_users.is_empty() {
            let mut lifetime = self.lifetime();
            for uid in &outcome.forgotten_users {
                lifetime.remove(uid);
            }
        }
        if outcome.marked_inactive > 0 || outcome.purged > 0 {
            debug!(
                "Device sweep: {} marked inactive, {} purged",
                outcome.marked_inactive, outcome.purged
            );
        }
        outcome
    }
}

/// Tags in first-seen order, each once.
fn dedup_tags(tags: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.iter()
        .filter(|tag| seen.insert(tag.as_str()))
        .cloned()
        .collect()
}

fn fill_if_empty(field: &mut String, value: String) {
    if field.is_empty() && !value.is_empty() {
        *field = value;
    }
}

/// Folds one backend's record into the merged one.
fn merge_meta(merged: &mut UserMeta, info: UserMeta, backend_name: &str) {
    merged.uplink = merged.uplink.saturating_add(info.uplink);
    merged.downlink = merged.downlink.saturating_add(info.downlink);
    fill_if_empty(&mut merged.remote_ip, info.remote_ip);
    if info.client_name.is_empty() {
        fill_if_empty(&mut merged.client_name, backend_name.to_string());
    } else {
        fill_if_empty(&mut merged.client_name, info.client_name);
    }
    fill_if_empty(&mut merged.user_agent, info.user_agent);
    fill_if_empty(&mut merged.protocol, info.protocol);
    fill_if_empty(&mut merged.tls_fingerprint, info.tls_fingerprint);
}

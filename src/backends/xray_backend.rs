use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::accounts::Account;
use super::backend_trait::{Backend, UserMeta, UsersMetaSource};
use super::cli_api::XrayCliApi;
use super::control_api::{parse_stat_name, ControlApi, Direction};
use super::xray_config::XrayConfig;
use crate::configuration::AgentConfig;
use crate::connection_tracking::ConnectionMetaCache;
use crate::error_handling::types::{BackendError, ControlApiError};
use crate::process_supervision::{find_free_port, CoreProcess, StopReason};
use crate::storage::types::{Inbound, User};
use crate::storage::Storage;

/// Builds the control API client for a given loopback port.
pub type ApiFactory = Box<dyn Fn(u16) -> Arc<dyn ControlApi> + Send + Sync>;

/// What changes with every start of the core.
#[derive(Default)]
struct LaunchState {
    api: Option<Arc<dyn ControlApi>>,
    inbounds: Vec<Inbound>,
    tags: HashSet<String>,
}

/// Backend driving an Xray core.
///
/// Design notes:
/// - A fresh loopback port is picked for the control API on every start and
///   injected into the configuration document.
/// - On start the document's inbounds are registered in the storage, on stop
///   they are removed from it.
/// - Restarts are serialized by `restart_lock`. The recovery loop takes the
///   same lock, so it never overlaps a restart.
pub struct XrayBackend {
    core: CoreProcess,
    storage: Arc<dyn Storage>,
    config_path: PathBuf,
    launch: RwLock<LaunchState>,
    restart_lock: Mutex<()>,
    api_factory: ApiFactory,
    restart_on_failure: bool,
    restart_interval: Duration,
}

impl XrayBackend {
    pub fn new(
        executable: impl Into<PathBuf>,
        assets_path: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        storage: Arc<dyn Storage>,
        meta_cache: ConnectionMetaCache,
    ) -> Self {
        let executable = executable.into();
        let api_executable = executable.clone();
        Self {
            core: CoreProcess::new(executable, assets_path, meta_cache),
            storage,
            config_path: config_path.into(),
            launch: RwLock::new(LaunchState::default()),
            restart_lock: Mutex::new(()),
            api_factory: Box::new(move |port| {
                Arc::new(XrayCliApi::new(api_executable.clone(), port)) as Arc<dyn ControlApi>
            }),
            restart_on_failure: true,
            restart_interval: Duration::ZERO,
        }
    }

    pub fn from_config(config: &AgentConfig, storage: Arc<dyn Storage>) -> Self {
        Self::new(
            &config.xray_executable_path,
            &config.xray_assets_path,
            &config.xray_config_path,
            storage,
            ConnectionMetaCache::from_config(&config.meta_cache),
        )
        .with_restart_policy(
            config.restart_on_failure,
            Duration::from_secs(config.restart_on_failure_interval_secs),
        )
    }

    pub fn with_restart_policy(mut self, enabled: bool, interval: Duration) -> Self {
        self.restart_on_failure = enabled;
        self.restart_interval = interval;
        self
    }

    pub fn with_api_factory(mut self, factory: ApiFactory) -> Self {
        self.api_factory = factory;
        self
    }

    pub fn with_core_timeouts(mut self, startup: Duration, stop: Duration) -> Self {
        self.core = self.core.with_timeouts(startup, stop);
        self
    }

    pub fn core(&self) -> &CoreProcess {
        &self.core
    }

    fn launch(&self) -> RwLockReadGuard<'_, LaunchState> {
        self.launch.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn launch_mut(&self) -> RwLockWriteGuard<'_, LaunchState> {
        self.launch.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn api(&self) -> Option<Arc<dyn ControlApi>> {
        self.launch().api.clone()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn save_config(&self, config: &str) -> Result<(), BackendError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.config_path, config)?;
        debug!("Saved core configuration to {}", self.config_path.display());
        Ok(())
    }

    /// Re-adds every stored user to every inbound of the running core.
    ///
    /// Failures are logged per user; the remaining users are still added.
    pub async fn add_storage_users(&self) -> usize {
        let inbounds = self.list_inbounds();
        let mut added = 0;
        for inbound in &inbounds {
            for user in self.storage.list_inbound_users(&inbound.tag) {
                match self.add_user(&user, inbound).await {
                    Ok(()) => added += 1,
                    Err(e) => warn!(
                        "Failed to re-add user {} to {}: {}",
                        user.id, inbound.tag, e
                    ),
                }
            }
        }
        info!("Re-added {} user membership(s) to the core", added);
        added
    }

    /// Stops the core and starts it again from the stored document, then
    /// re-adds the stored users. Callers hold the restart lock.
    async fn relaunch(&self) -> Result<(), BackendError> {
        self.core.stop().await?;
        self.start(None).await?;
        self.add_storage_users().await;
        Ok(())
    }

    /// Waits for core exits and brings crashed cores back up.
    ///
    /// Planned stops are ignored. A crash observed while a restart holds the
    /// lock is left to that restart. Returns when `cancel` fires.
    pub async fn run_recovery_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut stop_rx = self.core.stop_signal();
        // An exit that happened before the loop started is still handled.
        stop_rx.mark_changed();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Recovery loop cancelled");
                    return;
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }

            let signal = *stop_rx.borrow_and_update();
            match signal.reason {
                StopReason::NeverStarted => continue,
                StopReason::Planned => {
                    debug!("Core {} stopped as planned", signal.generation);
                    continue;
                }
                StopReason::Crashed => {}
            }

            let _guard = match self.restart_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(
                        "Core {} exited during a restart, leaving it to the restart",
                        signal.generation
                    );
                    continue;
                }
            };

            if !self.restart_on_failure {
                warn!(
                    "Core {} stopped unexpectedly, automatic restart is disabled",
                    signal.generation
                );
                continue;
            }

            warn!(
                "Core {} stopped unexpectedly, restarting in {:?}",
                signal.generation, self.restart_interval
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.restart_interval) => {}
            }

            match self.start(None).await {
                Ok(()) => {
                    self.add_storage_users().await;
                }
                Err(e) => error!("Failed to restart core after a crash: {}", e),
            }
        }
    }

    fn degrade(&self, operation: &str, err: ControlApiError) -> Result<(), BackendError> {
        if err.is_structural() {
            return Err(err.into());
        }
        warn!("{} requested while the core API is down: {}", operation, err);
        Ok(())
    }

    async fn fetch_stats_or_empty(&self, reset: bool) -> Vec<super::control_api::Stat> {
        let Some(api) = self.api() else {
            debug!("Stats requested before the core was started");
            return Vec::new();
        };
        match api.fetch_stats(reset).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Failed to fetch stats from the core: {}", e);
                Vec::new()
            }
        }
    }
}

fn pretty_config(raw: &str) -> Result<String, BackendError> {
    let document: Value =
        serde_json::from_str(raw).map_err(|e| BackendError::Config(e.to_string()))?;
    serde_json::to_string_pretty(&document).map_err(|e| BackendError::Config(e.to_string()))
}

#[async_trait]
impl Backend for XrayBackend {
    fn backend_type(&self) -> &'static str {
        "xray"
    }

    fn config_format(&self) -> u32 {
        1
    }

    async fn start(&self, config: Option<String>) -> Result<(), BackendError> {
        let raw = match config {
            Some(raw) => {
                self.save_config(&pretty_config(&raw)?)?;
                raw
            }
            None => self.get_config()?,
        };

        let api_port = find_free_port()?;
        let xray_config = XrayConfig::new(&raw, api_port)?;
        xray_config.register_inbounds(self.storage.as_ref());
        {
            let mut launch = self.launch_mut();
            launch.inbounds = xray_config.list_inbounds();
            launch.tags = xray_config.inbound_tags().into_iter().collect();
            launch.api = Some((self.api_factory)(api_port));
            info!(
                "Core inbounds: {:?}, control API on port {}",
                launch.tags, api_port
            );
        }

        self.core.start(&xray_config.to_json()).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.core.stop().await?;
        let tags: Vec<String> = {
            let mut launch = self.launch_mut();
            launch.inbounds.clear();
            launch.api = None;
            launch.tags.drain().collect()
        };
        for tag in &tags {
            self.storage.remove_inbound(tag);
        }
        Ok(())
    }

    async fn restart(&self, config: Option<String>) -> Result<(), BackendError> {
        let _guard = self
            .restart_lock
            .try_lock()
            .map_err(|_| BackendError::RestartInProgress)?;
        info!("Restarting core");
        match config {
            None => self.relaunch().await,
            Some(config) => {
                self.stop().await?;
                self.start(Some(config)).await
            }
        }
    }

    async fn add_user(&self, user: &User, inbound: &Inbound) -> Result<(), BackendError> {
        let account = Account::for_inbound(user, inbound)?;
        let Some(api) = self.api() else {
            warn!("User addition requested before the core was started");
            return Ok(());
        };
        match api.add_identity(&inbound.tag, &account).await {
            Ok(()) => Ok(()),
            Err(e) => self.degrade("User addition", e),
        }
    }

    async fn remove_user(&self, user: &User, inbound: &Inbound) -> Result<(), BackendError> {
        let Some(api) = self.api() else {
            warn!("User removal requested before the core was started");
            return Ok(());
        };
        match api.remove_identity(&inbound.tag, &user.identity()).await {
            Ok(()) => Ok(()),
            Err(e) => self.degrade("User removal", e),
        }
    }

    async fn get_usages(&self, reset: bool) -> Result<HashMap<u32, u64>, BackendError> {
        let mut usages: HashMap<u32, u64> = HashMap::new();
        for stat in self.fetch_stats_or_empty(reset).await {
            if let Some(parsed) = parse_stat_name(&stat.name) {
                let total = usages.entry(parsed.user_id).or_default();
                *total = total.saturating_add(stat.value);
            }
        }
        Ok(usages)
    }

    async fn running(&self) -> bool {
        self.core.running().await
    }

    fn version(&self) -> Option<String> {
        self.core.version()
    }

    fn contains_tag(&self, tag: &str) -> bool {
        self.launch().tags.contains(tag)
    }

    fn list_inbounds(&self) -> Vec<Inbound> {
        self.launch().inbounds.clone()
    }

    fn get_config(&self) -> Result<String, BackendError> {
        Ok(std::fs::read_to_string(&self.config_path)?)
    }

    fn logs(&self, include_buffer: bool) -> (Vec<String>, mpsc::Receiver<String>) {
        let buffer = if include_buffer {
            self.core.get_buffer()
        } else {
            Vec::new()
        };
        (buffer, self.core.subscribe())
    }

    fn users_meta(&self) -> Option<&dyn UsersMetaSource> {
        Some(self)
    }
}

#[async_trait]
impl UsersMetaSource for XrayBackend {
    async fn get_users_meta(&self) -> Result<HashMap<u32, UserMeta>, BackendError> {
        let mut meta: HashMap<u32, UserMeta> = HashMap::new();
        for stat in self.fetch_stats_or_empty(false).await {
            let Some(parsed) = parse_stat_name(&stat.name) else {
                continue;
            };
            let entry = meta.entry(parsed.user_id).or_default();
            match parsed.direction {
                Direction::Uplink => entry.uplink = entry.uplink.saturating_add(stat.value),
                Direction::Downlink => {
                    entry.downlink = entry.downlink.saturating_add(stat.value)
                }
            }
        }

        for (uid, remote_ip) in self.core.get_last_meta() {
            meta.entry(uid).or_default().remote_ip = remote_ip;
        }
        for entry in meta.values_mut() {
            entry.client_name = "xray".to_string();
        }

        debug!(
            "Metadata for {} user(s), {} with a known IP",
            meta.len(),
            meta.values().filter(|m| !m.remote_ip.is_empty()).count()
        );
        Ok(meta)
    }
}

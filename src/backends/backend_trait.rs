//! Backend Trait
//!
//! A backend is a managed proxy core plus the client of its control API.
//! The service layer only talks to backends through this trait, which keeps
//! reconciliation and aggregation testable without a real core.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error_handling::types::BackendError;
use crate::storage::types::{Inbound, User};

/// Per-user metadata reported by a backend.
///
/// Empty strings mean "unknown"; the aggregator fills them from other
/// backends or defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserMeta {
    pub uplink: u64,
    pub downlink: u64,
    pub remote_ip: String,
    pub client_name: String,
    pub user_agent: String,
    pub protocol: String,
    pub tls_fingerprint: String,
}

/// Optional capability: backends that can describe their users' connections.
#[async_trait]
pub trait UsersMetaSource: Send + Sync {
    async fn get_users_meta(&self) -> Result<HashMap<u32, UserMeta>, BackendError>;
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Kind of backend, e.g. `xray`.
    fn backend_type(&self) -> &'static str;

    /// Format number of the configuration document.
    fn config_format(&self) -> u32;

    /// Starts the core, with `config` replacing the stored document when given.
    async fn start(&self, config: Option<String>) -> Result<(), BackendError>;

    async fn stop(&self) -> Result<(), BackendError>;

    /// Restarts the core. Fails with `RestartInProgress` if another restart
    /// holds the lock.
    async fn restart(&self, config: Option<String>) -> Result<(), BackendError>;

    async fn add_user(&self, user: &User, inbound: &Inbound) -> Result<(), BackendError>;

    async fn remove_user(&self, user: &User, inbound: &Inbound) -> Result<(), BackendError>;

    /// Usage per user id since the last reset.
    async fn get_usages(&self, reset: bool) -> Result<HashMap<u32, u64>, BackendError>;

    async fn running(&self) -> bool;

    fn version(&self) -> Option<String>;

    fn contains_tag(&self, tag: &str) -> bool;

    fn list_inbounds(&self) -> Vec<Inbound>;

    /// Current configuration document, as stored on disk.
    fn get_config(&self) -> Result<String, BackendError>;

    /// Core output: the trailing buffer when `include_buffer`, then live lines.
    fn logs(&self, include_buffer: bool) -> (Vec<String>, mpsc::Receiver<String>);

    /// Metadata capability, if supported.
    fn users_meta(&self) -> Option<&dyn UsersMetaSource> {
        None
    }
}

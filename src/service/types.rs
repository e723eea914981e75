//! Request and reply types of the RPC surface.

use serde::{Deserialize, Serialize};

use crate::storage::types::User;
use crate::storage::DeviceRecord;

/// Desired inbound membership of one user.
///
/// An empty `inbound_tags` list means the user must be removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDelta {
    pub user: User,
    #[serde(default, alias = "inbounds")]
    pub inbound_tags: Vec<String>,
}

impl UserDelta {
    pub fn new(user: User, inbound_tags: &[&str]) -> Self {
        Self {
            user,
            inbound_tags: inbound_tags.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Merged per-user view across every backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserStats {
    pub uid: u32,
    pub usage: u64,
    pub uplink: u64,
    pub downlink: u64,
    pub remote_ip: String,
    pub client_name: String,
    pub user_agent: String,
    pub protocol: String,
    pub tls_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundInfo {
    pub tag: String,
    /// Inbound description as a JSON document.
    pub config: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub backend_type: String,
    pub version: Option<String>,
    pub inbounds: Vec<InboundInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfigReply {
    pub configuration: String,
    pub config_format: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserDevices {
    pub uid: u32,
    pub devices: Vec<DeviceRecord>,
}

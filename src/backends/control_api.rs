//! Capability interface over the core's control plane.

use async_trait::async_trait;

use super::accounts::Account;
use crate::error_handling::types::ControlApiError;

/// One counter as reported by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub name: String,
    pub value: u64,
}

impl Stat {
    pub fn new(name: impl Into<String>, value: u64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Direction of a traffic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Uplink,
    Downlink,
}

/// A parsed `user>>><identity>>>traffic>>><direction>` counter name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTrafficStat<'a> {
    pub user_id: u32,
    pub identity: &'a str,
    pub direction: Direction,
}

/// Parses a per-user traffic counter name. Anything else yields `None`.
pub fn parse_stat_name(name: &str) -> Option<UserTrafficStat<'_>> {
    let mut parts = name.split(">>>");
    let category = parts.next()?;
    let identity = parts.next()?;
    let kind = parts.next()?;
    let direction = parts.next()?;
    if parts.next().is_some() || category != "user" || kind != "traffic" {
        return None;
    }
    let direction = match direction {
        "uplink" => Direction::Uplink,
        "downlink" => Direction::Downlink,
        _ => return None,
    };
    Some(UserTrafficStat {
        user_id: crate::storage::types::parse_identity(identity)?,
        identity,
        direction,
    })
}

/// Add/remove identities on inbounds and read per-identity counters.
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// Attaches an account to the inbound `tag`.
    async fn add_identity(&self, tag: &str, account: &Account) -> Result<(), ControlApiError>;

    /// Detaches `identity` (the account email) from the inbound `tag`.
    async fn remove_identity(&self, tag: &str, identity: &str) -> Result<(), ControlApiError>;

    /// Reads the user counters, zeroing them when `reset` is set.
    async fn fetch_stats(&self, reset: bool) -> Result<Vec<Stat>, ControlApiError>;
}

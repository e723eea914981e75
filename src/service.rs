//! Service layer.
//!
//! Implements the controller-facing operations independently of any wire
//! transport: user reconciliation against the backends, stats aggregation,
//! backend inspection and device history queries.

pub mod agent_service;
#[cfg(test)]
pub mod tests;
pub mod types;

pub use agent_service::AgentService;
pub use types::{
    BackendConfigReply, BackendInfo, BackendStats, InboundInfo, UserDelta, UserDevices, UserStats,
};

//! Storage subsystem
//!
//! Components:
//! - `storage_trait`: the Storage trait, the agent's catalog of users and inbounds.
//! - `memory_storage`: in-memory implementation of the catalog.
//! - `devices`: per-user device history fed by the stats aggregator.
//! - `types`: users, inbounds and identities shared across the crate.

pub mod devices;
pub mod memory_storage;
pub mod storage_trait;
pub mod types;

pub use devices::{DeviceRecord, DeviceReport, DeviceStorage, SweepOutcome};
pub use memory_storage::MemoryStorage;
pub use storage_trait::Storage;
pub use types::{Inbound, User, UserRecord};

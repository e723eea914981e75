pub mod config;
pub mod types;

pub use config::{AgentConfig, Args};
pub use types::{DeviceHistoryConfig, MetaCacheConfig};

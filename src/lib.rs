pub mod backends;
pub mod configuration;
pub mod connection_tracking;
pub mod error_handling;
pub mod process_supervision;
pub mod service;
pub mod storage;
pub mod web_interface;

pub use backends::{Backend, XrayBackend};
pub use configuration::{AgentConfig, Args};
pub use service::AgentService;
pub use web_interface::WebServer;

//! Web interface: warp binding of the agent service.
pub mod routes;
pub mod types;
pub mod web_server;

pub use web_server::WebServer;

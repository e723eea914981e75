use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;

use super::routes::routes;
use crate::error_handling::types::WebError;
use crate::service::AgentService;

/// HTTP/WebSocket front of the agent service
pub struct WebServer {
    service: Arc<AgentService>,
}

impl WebServer {
    pub fn new(service: Arc<AgentService>) -> Self {
        Self { service }
    }

    /// Resolves the listening address from the configured host and port.
    pub fn address(bind_address: &str, port: u16) -> Result<SocketAddr, WebError> {
        let ip: IpAddr = bind_address
            .parse()
            .map_err(|e| WebError::Bind(format!("invalid bind address {}: {}", bind_address, e)))?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Serves until `cancel` fires.
    pub async fn run(self, addr: SocketAddr, cancel: CancellationToken) -> Result<(), WebError> {
        let routes = routes(self.service);
        info!("RPC surface listening on {}", addr);
        tokio::select! {
            _ = warp::serve(routes).run(addr) => {}
            _ = cancel.cancelled() => {
                info!("Web server shutting down");
            }
        }
        Ok(())
    }
}

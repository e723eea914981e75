use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use nodewarden::backends::Backend;
use nodewarden::configuration::{AgentConfig, Args};
use nodewarden::service::AgentService;
use nodewarden::storage::{DeviceStorage, MemoryStorage, Storage};
use nodewarden::web_interface::WebServer;
use nodewarden::XrayBackend;
use tokio_util::sync::CancellationToken;

const BACKEND_NAME: &str = "xray";

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match AgentConfig::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Unable to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(config.log_level_filter().unwrap_or(log::LevelFilter::Info))
        .format_target(false)
        .init();

    info!("nodewarden v{} starting", env!("CARGO_PKG_VERSION"));

    let addr = match WebServer::address(&config.bind_address, config.rpc_port) {
        Ok(addr) => addr,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let devices = Arc::new(DeviceStorage::from_config(&config.devices));
    let xray = Arc::new(XrayBackend::from_config(&config, storage.clone()));
    let cancel = CancellationToken::new();

    // Watching before the first start so that an immediate crash is not missed.
    let recovery = tokio::spawn(xray.clone().run_recovery_loop(cancel.clone()));

    info!("Starting backend `{}`", BACKEND_NAME);
    if let Err(e) = xray.start(None).await {
        error!(
            "Backend `{}` failed to start: {}; waiting for a restart request",
            BACKEND_NAME, e
        );
    }

    let service = Arc::new(AgentService::new(
        storage,
        vec![(BACKEND_NAME.to_string(), xray.clone() as Arc<dyn Backend>)],
        devices,
    ));

    let sweep_period = Duration::from_secs(config.devices.sweep_interval_secs.max(1));
    let sweeper = tokio::spawn(service.clone().run_device_sweeper(sweep_period, cancel.clone()));

    let server = tokio::spawn(WebServer::new(service).run(addr, cancel.clone()));

    wait_for_shutdown().await;
    info!("Shutting down");
    cancel.cancel();

    if let Err(e) = xray.stop().await {
        warn!("Failed to stop backend `{}`: {}", BACKEND_NAME, e);
    }

    for (name, task) in [("recovery loop", recovery), ("device sweeper", sweeper)] {
        if let Err(e) = task.await {
            error!("Error joining the {}: {:?}", name, e);
        }
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Web server error: {}", e),
        Err(e) => error!("Error joining the web server: {:?}", e),
    }
    info!("Bye");
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Unable to listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received"),
        _ = terminate.recv() => info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

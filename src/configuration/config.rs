use super::types::*;
use crate::error_handling::types::ConfigError;
use clap::Parser;
use log::{debug, info};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Command-line arguments of the agent.
///
/// Every option can also be supplied through the environment, which is how
/// the agent is usually configured inside a container. Values given here
/// override the ones read from the configuration file.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "nodewarden")]
#[command(about = "Node agent supervising a proxy core on behalf of a fleet controller")]
pub struct Args {
    /// Path to a TOML configuration file
    ///
    /// # Command Line
    /// Use `--config <PATH>` or `NODEWARDEN_CONFIG`
    #[arg(long, short, env = "NODEWARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path of the core executable
    #[arg(long, env = "XRAY_EXECUTABLE_PATH")]
    pub xray_executable_path: Option<PathBuf>,

    /// Directory holding the core's geo assets
    #[arg(long, env = "XRAY_ASSETS_PATH")]
    pub xray_assets_path: Option<PathBuf>,

    /// Path of the JSON document fed to the core
    #[arg(long, env = "XRAY_CONFIG_PATH")]
    pub xray_config_path: Option<PathBuf>,

    /// Address the RPC surface binds to
    #[arg(long, env = "NODEWARDEN_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Port the RPC surface listens on
    #[arg(long, env = "NODEWARDEN_RPC_PORT")]
    pub rpc_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "NODEWARDEN_LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Runtime configuration of the agent.
///
/// # Fields Overview
///
/// - `xray_*`: where the core binary, its assets and its JSON document live
/// - `bind_address` / `rpc_port`: where the controller reaches the agent
/// - `restart_on_failure`: whether a crashed core is brought back up, after
///   `restart_on_failure_interval_secs`
/// - `meta_cache`: bounds of the access-log metadata cache
/// - `devices`: aging policy of the device history
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_xray_executable_path")]
    pub xray_executable_path: PathBuf,

    #[serde(default = "default_xray_assets_path")]
    pub xray_assets_path: PathBuf,

    #[serde(default = "default_xray_config_path")]
    pub xray_config_path: PathBuf,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,

    #[serde(default = "default_restart_on_failure")]
    pub restart_on_failure: bool,

    #[serde(default)]
    pub restart_on_failure_interval_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub meta_cache: MetaCacheConfig,

    #[serde(default)]
    pub devices: DeviceHistoryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            xray_executable_path: default_xray_executable_path(),
            xray_assets_path: default_xray_assets_path(),
            xray_config_path: default_xray_config_path(),
            bind_address: default_bind_address(),
            rpc_port: default_rpc_port(),
            restart_on_failure: default_restart_on_failure(),
            restart_on_failure_interval_secs: 0,
            log_level: default_log_level(),
            meta_cache: MetaCacheConfig::default(),
            devices: DeviceHistoryConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Reads a configuration from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Reading configuration from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig =
            toml::from_str(raw).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the effective configuration: file (if any), then CLI/env overrides.
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => {
                debug!("No configuration file given, starting from defaults");
                Self::default()
            }
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(path) = &args.xray_executable_path {
            self.xray_executable_path = path.clone();
        }
        if let Some(path) = &args.xray_assets_path {
            self.xray_assets_path = path.clone();
        }
        if let Some(path) = &args.xray_config_path {
            self.xray_config_path = path.clone();
        }
        if let Some(address) = &args.bind_address {
            self.bind_address = address.clone();
        }
        if let Some(port) = args.rpc_port {
            self.rpc_port = port;
        }
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.xray_executable_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue(
                "xray_executable_path must not be empty".to_string(),
            ));
        }
        if self.meta_cache.capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "meta_cache.capacity must be greater than zero".to_string(),
            ));
        }
        if self.devices.inactivity_timeout_secs >= self.devices.max_age_secs {
            return Err(ConfigError::InvalidValue(format!(
                "devices.inactivity_timeout_secs ({}) must be lower than devices.max_age_secs ({})",
                self.devices.inactivity_timeout_secs, self.devices.max_age_secs
            )));
        }
        if self.log_level_filter().is_none() {
            return Err(ConfigError::InvalidValue(format!(
                "unknown log level `{}`",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn log_level_filter(&self) -> Option<log::LevelFilter> {
        self.log_level.parse().ok()
    }
}

fn default_xray_executable_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/xray")
}

fn default_xray_assets_path() -> PathBuf {
    PathBuf::from("/usr/local/share/xray")
}

fn default_xray_config_path() -> PathBuf {
    PathBuf::from("/var/lib/nodewarden/xray_config.json")
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_rpc_port() -> u16 {
    53042
}

fn default_restart_on_failure() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

//! Error types for every subsystem of the agent.
//!
//! Each subsystem owns one enum. Higher layers wrap lower layers through
//! `#[from]` so that `?` carries the original cause up to the RPC surface.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlError(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Failures while driving the core child process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("core process is already running")]
    AlreadyRunning,
    #[error("failed to spawn core process: {0}")]
    Spawn(String),
    #[error("failed to signal core process: {0}")]
    Signal(String),
}

/// Errors returned by the core's control API.
///
/// The first three variants are structural: they mean the agent's view of
/// the core disagrees with reality and must reach the caller. `Unavailable`
/// is transient and is degraded to a warning by the backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControlApiError {
    #[error("identity already exists: {0}")]
    IdentityExists(String),
    #[error("identity not found: {0}")]
    IdentityNotFound(String),
    #[error("inbound tag not found: {0}")]
    TagNotFound(String),
    #[error("control API unavailable: {0}")]
    Unavailable(String),
}

impl ControlApiError {
    pub fn is_structural(&self) -> bool {
        !matches!(self, ControlApiError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("control API error: {0}")]
    ControlApi(#[from] ControlApiError),
    #[error("a restart is already in progress")]
    RestartInProgress,
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),
    #[error("backend configuration error: {0}")]
    Config(String),
    #[error("backend IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("user {0} not found")]
    UserNotFound(u32),
    #[error("inbound {0} not found")]
    InboundNotFound(String),
}

/// Errors surfaced by the RPC-facing service layer.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("backend {0} doesn't exist")]
    BackendNotFound(String),
    #[error("no backend serves inbound {0}")]
    InboundNotFound(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum WebError {
    #[error("web server bind error: {0}")]
    Bind(String),
}

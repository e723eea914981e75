//! Backends subsystem.
//!
//! A backend couples a supervised core process with the client of its
//! control API. [`XrayBackend`] is the only implementation; the service layer
//! works against the [`Backend`] trait.

pub mod accounts;
pub mod backend_trait;
pub mod cli_api;
pub mod control_api;
pub mod xray_backend;
pub mod xray_config;

pub use accounts::Account;
pub use backend_trait::{Backend, UserMeta, UsersMetaSource};
pub use cli_api::XrayCliApi;
pub use control_api::{ControlApi, Stat};
pub use xray_backend::XrayBackend;
pub use xray_config::XrayConfig;

//! Process supervision subsystem.
//!
//! Owns the lifecycle of the proxy core child process: spawning it with its
//! configuration on stdin, detecting readiness, stopping it gracefully and
//! telling planned stops from crashes.
//!
//! Re-exports:
//! - [`CoreProcess`]: start/stop/restart and state queries.
//! - [`LogHub`]: fan-out of the child's output lines.
//! - [`StopReason`], [`StopSignal`], [`RunningCore`]: core types.

pub mod core_process;
pub mod log_hub;
pub mod types;
pub mod utils;

pub use core_process::CoreProcess;
pub use log_hub::LogHub;
pub use types::{RunningCore, StopReason, StopSignal};
pub use utils::{find_free_port, get_version};

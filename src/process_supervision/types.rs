//! Core types used by the process supervision subsystem.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Why the last core process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// No process has exited yet.
    NeverStarted,
    /// The process was stopped through [`super::CoreProcess::stop`].
    Planned,
    /// The process exited on its own.
    Crashed,
}

/// Value published on the stop channel each time a core process exits.
///
/// `generation` increases with every spawned process, so a waiter can tell
/// the exit of the process it cares about from an older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSignal {
    pub generation: u64,
    pub reason: StopReason,
}

impl StopSignal {
    pub fn initial() -> Self {
        StopSignal {
            generation: 0,
            reason: StopReason::NeverStarted,
        }
    }
}

/// Bookkeeping for the currently running core process.
///
/// The `Child` itself is owned by the I/O pump task; this handle only keeps
/// what is needed to signal it and to answer state queries.
#[derive(Debug, Clone)]
pub struct RunningCore {
    /// OS process id of the child.
    pub pid: u32,
    /// Generation number assigned at spawn time.
    pub generation: u64,
    /// Set before a planned stop, read by the pump when the child exits.
    pub(crate) planned: Arc<AtomicBool>,
    /// Set by the pump once the child has been reaped.
    pub(crate) exited: Arc<AtomicBool>,
}

impl RunningCore {
    pub fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }
}

//! Connection metadata subsystem.
//!
//! The core does not expose who is connected from where through its control
//! API, so this module derives it from the access log: every line the log hub
//! reads is handed to [`ConnectionMetaCache::handle_line`], which keeps the
//! last remote IP seen for each user id.
//!
//! Re-exports:
//! - [`ConnectionMetaCache`]: the bounded, time-limited cache.
//! - [`AccessRecord`], [`parse_access_line`]: the line parser.

pub mod access_log;
pub mod meta_cache;

pub use access_log::{parse_access_line, AccessRecord};
pub use meta_cache::ConnectionMetaCache;

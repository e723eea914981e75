//! Access-log line parsing.
//!
//! The core prints one line per accepted connection, e.g.
//!
//! ```text
//! 2024/05/01 10:00:00 from 203.0.113.7:51234 accepted tcp:example.com:443 [vless-in >> direct] email: 12.alice
//! ```
//!
//! Only two things are extracted: the client address and the `<id>.<name>`
//! identity. The exact layout differs between core versions, so a line that
//! does not match is simply ignored.

use std::net::{IpAddr, SocketAddr};

use lazy_static::lazy_static;
use regex::Regex;

use crate::storage::types::parse_identity;

lazy_static! {
    /// Identity marker, `email: <id>.<name>`
    static ref IDENTITY_PATTERN: Regex =
        Regex::new(r"email[:\s]+(?P<email>[\w.\-@]+)").unwrap();

    /// Address marker, `from <addr>` / `ip: <addr>` / `remote: <addr>`
    static ref ADDRESS_PATTERN: Regex = Regex::new(
        r"(?:\bfrom\s+|\bip:\s*|\bremote:\s*)(?:tcp:|udp:)?(?P<addr>\[[0-9a-fA-F:.]+\](?::\d+)?|[0-9a-fA-F:.]+)"
    )
    .unwrap();
}

/// What a qualifying access-log line tells about a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub user_id: u32,
    pub remote_ip: String,
}

/// Substring test run before any regex work.
fn has_markers(line: &str) -> bool {
    line.contains("email")
        && (line.contains("from") || line.contains("ip:") || line.contains("remote:"))
}

/// Parses one log line. Returns `None` for anything that is not an access
/// line carrying both markers and a numeric identity.
pub fn parse_access_line(line: &str) -> Option<AccessRecord> {
    if !has_markers(line) {
        return None;
    }
    let identity = IDENTITY_PATTERN.captures(line)?.name("email")?.as_str();
    let user_id = parse_identity(identity)?;
    let address = ADDRESS_PATTERN.captures(line)?.name("addr")?.as_str();
    let remote_ip = normalize_address(address)?;
    Some(AccessRecord {
        user_id,
        remote_ip: remote_ip.to_string(),
    })
}

/// Strips the port (and IPv6 brackets) from an address token.
fn normalize_address(token: &str) -> Option<IpAddr> {
    if let Some(rest) = token.strip_prefix('[') {
        let (inner, _) = rest.split_once(']')?;
        return inner.parse().ok();
    }
    if let Ok(socket) = token.parse::<SocketAddr>() {
        return Some(socket.ip());
    }
    if let Ok(ip) = token.parse::<IpAddr>() {
        return Some(ip);
    }
    let (host, port) = token.rsplit_once(':')?;
    port.parse::<u16>().ok()?;
    host.parse().ok()
}

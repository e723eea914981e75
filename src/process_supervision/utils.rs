use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;

use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use tokio::process::Command;

lazy_static! {
    static ref VERSION_PATTERN: Regex = Regex::new(r"^Xray (\d+\.\d+\.\d+)").unwrap();
    static ref STARTED_BANNER: Regex =
        Regex::new(r".*\[Warning\] core: Xray \d+\.\d+\.\d+ started").unwrap();
}

/// Runs `<executable> version` and extracts the semantic version.
pub async fn get_version(executable: &Path) -> Option<String> {
    let output = match Command::new(executable).arg("version").output().await {
        Ok(output) => output,
        Err(e) => {
            warn!(
                "Failed to query version of {}: {}",
                executable.display(),
                e
            );
            return None;
        }
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = parse_version(&stdout);
    debug!("{} reports version {:?}", executable.display(), version);
    version
}

pub fn parse_version(output: &str) -> Option<String> {
    VERSION_PATTERN
        .captures(output.trim_start())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Whether a log line is the core's readiness banner.
pub fn is_started_banner(line: &str) -> bool {
    STARTED_BANNER.is_match(line)
}

/// Picks a free TCP port on the loopback interface.
///
/// The listener is closed before returning so the core can bind the port.
pub fn find_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    debug!("Allocated loopback port {}", port);
    Ok(port)
}

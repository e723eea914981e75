use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use super::accounts::Account;
use super::control_api::{ControlApi, Stat};
use crate::error_handling::types::ControlApiError;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// [`ControlApi`] driven through the core binary's own `api` subcommands.
///
/// Every call spawns `<executable> api <command> -s 127.0.0.1:<port> ...`
/// against the loopback API inbound injected into the core's configuration.
pub struct XrayCliApi {
    executable: PathBuf,
    server: String,
}

impl XrayCliApi {
    pub fn new(executable: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            executable: executable.into(),
            server: format!("127.0.0.1:{}", port),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    async fn call(&self, args: &[&str]) -> Result<String, ControlApiError> {
        trace!("xray api {:?} -s {}", args, self.server);
        let mut command = Command::new(&self.executable);
        command
            .arg("api")
            .arg(args[0])
            .arg("-s")
            .arg(&self.server)
            .args(&args[1..])
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(CALL_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ControlApiError::Unavailable(e.to_string())),
            Err(_) => {
                return Err(ControlApiError::Unavailable(format!(
                    "`api {}` timed out after {:?}",
                    args[0], CALL_TIMEOUT
                )))
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if output.status.success() && !looks_like_failure(&text) {
            return Ok(text);
        }
        Err(ControlApiError::Unavailable(text.trim().to_string()))
    }
}

#[async_trait]
impl ControlApi for XrayCliApi {
    async fn add_identity(&self, tag: &str, account: &Account) -> Result<(), ControlApiError> {
        let document = json!({
            "inbounds": [{
                "tag": tag,
                "protocol": account.protocol,
                "settings": { "clients": [account.record] },
            }]
        });
        let mut file = tempfile::Builder::new()
            .prefix("nodewarden-adu-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| ControlApiError::Unavailable(e.to_string()))?;
        file.write_all(document.to_string().as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| ControlApiError::Unavailable(e.to_string()))?;
        let path = file.path().to_string_lossy().into_owned();

        match self.call(&["adu", &path]).await {
            Ok(_) => {
                debug!("Added {} to {}", account.email, tag);
                Ok(())
            }
            Err(ControlApiError::Unavailable(text)) => {
                Err(classify(&text, tag, &account.email, Operation::Add))
            }
            Err(other) => Err(other),
        }
    }

    async fn remove_identity(&self, tag: &str, identity: &str) -> Result<(), ControlApiError> {
        let tag_arg = format!("-tag={}", tag);
        match self.call(&["rmu", &tag_arg, identity]).await {
            Ok(_) => {
                debug!("Removed {} from {}", identity, tag);
                Ok(())
            }
            Err(ControlApiError::Unavailable(text)) => {
                Err(classify(&text, tag, identity, Operation::Remove))
            }
            Err(other) => Err(other),
        }
    }

    async fn fetch_stats(&self, reset: bool) -> Result<Vec<Stat>, ControlApiError> {
        let mut args = vec!["statsquery", "-pattern", "user>>>"];
        if reset {
            args.push("-reset");
        }
        let text = self.call(&args).await?;
        parse_stats(&text)
    }
}

/// Successful exits that still report a failure in their output.
fn looks_like_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("already exists") || lower.contains("not found")
}

/// The identity operation an error text came back from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Remove,
}

/// Maps the core's error text onto the control API taxonomy.
///
/// The CLI echoes the request (`add user: <email>`), so the identity or the
/// word "user" in the text says nothing about what was missing. A missing
/// inbound shows up as "handler not found"; an addition can only miss its tag.
pub fn classify(text: &str, tag: &str, identity: &str, operation: Operation) -> ControlApiError {
    let lower = text.to_lowercase();
    if lower.contains("already exists") {
        return ControlApiError::IdentityExists(identity.to_string());
    }
    if lower.contains("not found") {
        if operation == Operation::Add || lower.contains("handler not found") {
            return ControlApiError::TagNotFound(tag.to_string());
        }
        return ControlApiError::IdentityNotFound(identity.to_string());
    }
    ControlApiError::Unavailable(text.to_string())
}

#[derive(Debug, Deserialize)]
struct StatsQueryOutput {
    #[serde(default)]
    stat: Vec<RawStat>,
}

#[derive(Debug, Deserialize)]
struct RawStat {
    name: String,
    #[serde(default)]
    value: Value,
}

/// Parses `statsquery` output. Counter values may be numbers, numeric
/// strings, or absent when zero.
pub fn parse_stats(text: &str) -> Result<Vec<Stat>, ControlApiError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let output: StatsQueryOutput = serde_json::from_str(text)
        .map_err(|e| ControlApiError::Unavailable(format!("unreadable stats output: {}", e)))?;
    Ok(output
        .stat
        .into_iter()
        .map(|raw| {
            let value = match &raw.value {
                Value::Number(n) => n.as_u64().unwrap_or(0),
                Value::String(s) => s.trim().parse().unwrap_or(0),
                _ => 0,
            };
            Stat {
                name: raw.name,
                value,
            }
        })
        .collect())
}

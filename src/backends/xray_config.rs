//! The JSON document fed to the core.
//!
//! The document is treated as opaque apart from a few keys: the log level is
//! raised so that access lines exist, and the control API plumbing is
//! injected (API services, stats, per-user counters policy, a loopback API
//! inbound and the routing rule that reaches it). No schema validation.

use serde_json::{json, Map, Value};

use crate::error_handling::types::BackendError;
use crate::storage::types::Inbound;
use crate::storage::Storage;

pub const API_INBOUND_TAG: &str = "API_INBOUND";
pub const API_OUTBOUND_TAG: &str = "API";

/// Log levels too quiet for access-line parsing.
const QUIET_LEVELS: [&str; 2] = ["none", "error"];

#[derive(Debug, Clone)]
pub struct XrayConfig {
    document: Value,
    api_port: u16,
}

impl XrayConfig {
    pub fn new(raw: &str, api_port: u16) -> Result<Self, BackendError> {
        let document: Value =
            serde_json::from_str(raw).map_err(|e| BackendError::Config(e.to_string()))?;
        if !document.is_object() {
            return Err(BackendError::Config(
                "configuration must be a JSON object".to_string(),
            ));
        }
        let mut config = XrayConfig { document, api_port };
        config.raise_log_level();
        config.inject_api();
        Ok(config)
    }

    fn raise_log_level(&mut self) {
        let log = ensure_object(&mut self.document["log"]);
        let quiet = match log["loglevel"].as_str() {
            Some(level) => QUIET_LEVELS.contains(&level),
            None => true,
        };
        if quiet {
            log["loglevel"] = json!("warning");
        }
    }

    fn inject_api(&mut self) {
        self.document["api"] = json!({
            "services": ["HandlerService", "StatsService", "LoggerService"],
            "tag": API_OUTBOUND_TAG,
        });
        self.document["stats"] = json!({});

        let policy = ensure_object(&mut self.document["policy"]);
        let level0 = ensure_object(&mut ensure_object(&mut policy["levels"])["0"]);
        level0["statsUserUplink"] = json!(true);
        level0["statsUserDownlink"] = json!(true);

        let api_inbound = json!({
            "listen": "127.0.0.1",
            "port": self.api_port,
            "protocol": "dokodemo-door",
            "settings": { "address": "127.0.0.1" },
            "tag": API_INBOUND_TAG,
        });
        if let Value::Array(inbounds) = ensure_array(&mut self.document["inbounds"]) {
            inbounds.retain(|i| tag_of(i) != Some(API_INBOUND_TAG));
            inbounds.push(api_inbound);
        }

        let routing = ensure_object(&mut self.document["routing"]);
        if let Value::Array(rules) = ensure_array(&mut routing["rules"]) {
            rules.insert(
                0,
                json!({
                    "inboundTag": [API_INBOUND_TAG],
                    "outboundTag": API_OUTBOUND_TAG,
                    "type": "field",
                }),
            );
        }
    }

    /// User-facing inbounds as found in the document. Untagged ones are skipped.
    fn user_inbounds(&self) -> impl Iterator<Item = &Value> {
        self.document
            .get("inbounds")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|i| matches!(tag_of(i), Some(tag) if tag != API_INBOUND_TAG))
    }

    pub fn inbound_tags(&self) -> Vec<String> {
        self.user_inbounds()
            .filter_map(tag_of)
            .map(str::to_string)
            .collect()
    }

    pub fn list_inbounds(&self) -> Vec<Inbound> {
        self.user_inbounds().map(describe_inbound).collect()
    }

    /// Makes every user-facing inbound known to the storage.
    pub fn register_inbounds(&self, storage: &dyn Storage) {
        for inbound in self.list_inbounds() {
            storage.register_inbound(inbound);
        }
    }

    pub fn to_json(&self) -> String {
        self.document.to_string()
    }
}

fn tag_of(inbound: &Value) -> Option<&str> {
    inbound.get("tag").and_then(Value::as_str)
}

fn describe_inbound(raw: &Value) -> Inbound {
    let tag = tag_of(raw).unwrap_or_default();
    let protocol = raw
        .get("protocol")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let stream = raw.get("streamSettings");
    let network = stream
        .and_then(|s| s.get("network"))
        .and_then(Value::as_str)
        .unwrap_or("tcp");
    let security = stream
        .and_then(|s| s.get("security"))
        .and_then(Value::as_str)
        .unwrap_or("none");
    let settings = raw.get("settings");
    let flow = settings
        .and_then(|s| s.get("flow"))
        .or_else(|| {
            settings
                .and_then(|s| s.get("clients"))
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("flow"))
        })
        .cloned()
        .unwrap_or(Value::Null);

    Inbound::new(
        tag,
        protocol,
        json!({
            "tag": tag,
            "protocol": protocol,
            "port": raw.get("port").cloned().unwrap_or(Value::Null),
            "network": network,
            "security": security,
            "flow": flow,
        }),
    )
}

/// Replaces `value` with an empty object unless it already is one.
fn ensure_object(value: &mut Value) -> &mut Value {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    value
}

fn ensure_array(value: &mut Value) -> &mut Value {
    if !value.is_array() {
        *value = Value::Array(Vec::new());
    }
    value
}

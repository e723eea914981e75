use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user known to the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u32,
    pub username: String,
    /// Opaque credential material, turned into a protocol account by the backend.
    pub key: String,
}

impl User {
    /// The `<id>.<username>` string the core uses as the user's identity.
    pub fn identity(&self) -> String {
        format!("{}.{}", self.id, self.username)
    }
}

/// Parses the numeric user id out of an identity (`"<id>.<rest>"`).
///
/// Returns `None` when the part before the first `.` is not a number.
pub fn parse_identity(identity: &str) -> Option<u32> {
    let (id, _) = identity.split_once('.')?;
    id.parse().ok()
}

/// A named ingress of a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub protocol: String,
    pub config: Value,
}

impl Inbound {
    pub fn new(tag: impl Into<String>, protocol: impl Into<String>, config: Value) -> Self {
        Self {
            tag: tag.into(),
            protocol: protocol.into(),
            config,
        }
    }

    /// The `flow` option of the inbound, empty when not set.
    pub fn flow(&self) -> &str {
        self.config
            .get("flow")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// A stored user together with the inbounds it is attached to.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub user: User,
    pub inbounds: Vec<Inbound>,
}

impl UserRecord {
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.inbounds.iter().map(|i| i.tag.as_str())
    }
}

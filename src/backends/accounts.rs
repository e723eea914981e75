//! Protocol accounts handed to the core when a user joins an inbound.

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error_handling::types::BackendError;
use crate::storage::types::{Inbound, User};

pub const SHADOWSOCKS_METHOD: &str = "chacha20-ietf-poly1305";

/// An account record for one protocol. `email` carries the user identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub protocol: String,
    pub email: String,
    pub record: Value,
}

impl Account {
    /// Builds the account of `user` on `inbound`.
    ///
    /// VMess and VLESS ids are derived from the key, so the same key always
    /// maps to the same id.
    pub fn for_inbound(user: &User, inbound: &Inbound) -> Result<Self, BackendError> {
        let email = user.identity();
        let record = match inbound.protocol.as_str() {
            "vmess" => json!({ "id": derive_id(&user.key), "email": email }),
            "vless" => json!({
                "id": derive_id(&user.key),
                "email": email,
                "flow": inbound.flow(),
            }),
            "trojan" => json!({ "password": user.key, "email": email }),
            "shadowsocks" => json!({
                "password": user.key,
                "method": SHADOWSOCKS_METHOD,
                "email": email,
            }),
            other => return Err(BackendError::UnsupportedProtocol(other.to_string())),
        };
        Ok(Account {
            protocol: inbound.protocol.clone(),
            email,
            record,
        })
    }
}

fn derive_id(key: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()).to_string()
}

use serde::{Deserialize, Serialize};

/// API error payload
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ApiError {
    pub message: String,
}

/// Query of `GET /users/{uid}/devices`.
#[derive(Debug, Default, Deserialize)]
pub struct DevicesQuery {
    #[serde(default)]
    pub active_only: bool,
}

/// Query of `GET /backends/{name}/logs`.
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_include_buffer")]
    pub include_buffer: bool,
}

impl Default for LogsQuery {
    fn default() -> Self {
        Self {
            include_buffer: default_include_buffer(),
        }
    }
}

fn default_include_buffer() -> bool {
    true
}

/// Body of `POST /backends/{name}/restart`. Absent or empty keeps the stored config.
#[derive(Debug, Default, Deserialize)]
pub struct RestartRequest {
    #[serde(default)]
    pub config: Option<String>,
}

/// Reply of the write operations.
#[derive(Debug, Serialize)]
pub struct Applied {
    pub applied: usize,
}

use serde::Deserialize;

/// Bounds of the connection metadata cache fed by the core's access log.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MetaCacheConfig {
    /// Entries untouched for longer than this are evicted.
    #[serde(default = "default_meta_ttl_secs")]
    pub ttl_secs: u64,
    /// Hard cap on the number of tracked users.
    #[serde(default = "default_meta_capacity")]
    pub capacity: usize,
    /// Minimum delay between two TTL sweeps.
    #[serde(default = "default_meta_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for MetaCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_meta_ttl_secs(),
            capacity: default_meta_capacity(),
            cleanup_interval_secs: default_meta_cleanup_interval_secs(),
        }
    }
}

/// Aging policy of the per-user device history.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceHistoryConfig {
    /// A device not seen for this long is reported as inactive.
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    /// A device not seen for this long is forgotten.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Period of the background sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for DeviceHistoryConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            max_age_secs: default_max_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_meta_ttl_secs() -> u64 {
    3600
}

fn default_meta_capacity() -> usize {
    10_000
}

fn default_meta_cleanup_interval_secs() -> u64 {
    300
}

fn default_inactivity_timeout_secs() -> u64 {
    300
}

fn default_max_age_secs() -> u64 {
    7 * 86_400
}

fn default_sweep_interval_secs() -> u64 {
    60
}

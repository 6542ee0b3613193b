//! Bridge configuration
//!
//! All tunables in one serde struct so an embedding binary can load them
//! from a JSON file. Chunk size and slot capacities are fixed inputs to
//! the upload coordinator, not discovered at runtime.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Peripheral address to connect to.
    pub address: String,
    pub connect_timeout: Duration,
    /// Stop-and-wait acknowledgement deadline per chunk.
    pub ack_timeout: Duration,
    /// Deadline for the device to confirm a committed slot after the
    /// final chunk.
    pub commit_timeout: Duration,
    /// Bytes per content chunk; clamped to the link MTU.
    pub chunk_size: usize,
    /// Capacity of each device-side content slot.
    pub slot_capacities: Vec<usize>,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub cache_path: PathBuf,
    pub cache_debounce: Duration,
    /// Event ring size per subscriber.
    pub event_capacity: usize,
    pub backoff: BackoffConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Jitter fraction applied per attempt, e.g. 0.25 for +/- 25%.
    pub jitter: f64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(2),
            commit_timeout: Duration::from_secs(5),
            chunk_size: protocol::FILE_CHUNK_SIZE,
            slot_capacities: vec![128 * 1024, 512 * 1024, 2_000_000],
            keepalive_interval: Duration::from_secs(3),
            keepalive_timeout: Duration::from_secs(2),
            cache_path: PathBuf::from("furby_state.json"),
            cache_debounce: Duration::from_secs(1),
            event_capacity: 256,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"address": "aa:bb:cc:dd:ee:ff", "chunk_size": 4096}"#)
                .unwrap();
        assert_eq!(config.address, "aa:bb:cc:dd:ee:ff");
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.backoff.cap, Duration::from_secs(30));
        assert_eq!(config.slot_capacities.len(), 3);
    }

    #[test]
    fn round_trips_through_json() {
        let config = BridgeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: BridgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cache_debounce, config.cache_debounce);
        assert_eq!(back.backoff.jitter, config.backoff.jitter);
    }
}

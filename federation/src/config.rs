use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A peer to dial at startup or through the registry endpoints.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PeerSeed {
    pub node_id: String,
    /// Base address of the peer's gateway, e.g. `ws://10.0.0.2:8080` or
    /// `10.0.0.2:8080`.
    pub address: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct FederationConfig {
    pub host: String,
    pub port: u16,
    /// Stable identifier for this node; generated (16 hex chars) when
    /// absent.
    pub node_id: Option<String>,
    pub enable_registry: bool,
    /// Permissive CORS on the gateway.
    pub enable_cors: bool,
    /// Health ping / registry sync cadence.
    pub discovery_interval_secs: u64,
    /// Ceiling for the outbound connect handshake.
    pub read_timeout_secs: u64,
    /// Ceiling for one WebSocket frame write.
    pub write_timeout_secs: u64,
    /// Bounded per-connection send queue.
    pub peer_queue_capacity: usize,
    /// Hop budget for multi-hop routing.
    pub ttl_default: u32,
    pub peers_on_start: Vec<PeerSeed>,
}

impl Default for FederationConfig {
    fn default() -> Self {
        FederationConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            node_id: None,
            enable_registry: true,
            enable_cors: true,
            discovery_interval_secs: 30,
            read_timeout_secs: 15,
            write_timeout_secs: 15,
            peer_queue_capacity: 100,
            ttl_default: 8,
            peers_on_start: Vec::new(),
        }
    }
}

impl FederationConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Generates a random 16-hex-char node identifier.
pub fn random_node_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = FederationConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.ttl_default, 8);
        assert_eq!(config.peer_queue_capacity, 100);
        assert_eq!(config.discovery_interval(), Duration::from_secs(30));
        assert!(config.enable_registry);
    }

    #[test]
    fn node_ids_are_sixteen_hex_chars() {
        let id = random_node_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(random_node_id(), random_node_id());
    }
}

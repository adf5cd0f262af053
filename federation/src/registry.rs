//! Response payloads for the `/registry` endpoint family.

use runtime::eval::Runtime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub node_id: String,
    pub node_address: String,
    pub local_servers: Vec<ServerEntry>,
    pub peers: Vec<PeerEntry>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub methods: Vec<String>,
    pub last_seen: u64,
    pub is_local: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub last_seen: u64,
    pub is_healthy: bool,
    pub server_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct AddPeerRequest {
    pub node_id: String,
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct RemovePeerRequest {
    pub node_id: String,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// Entries for servers running in this process.
pub fn local_server_entries(runtime: &Runtime) -> Vec<ServerEntry> {
    let mut entries: Vec<ServerEntry> = runtime
        .servers()
        .handles()
        .into_iter()
        .map(|handle| ServerEntry {
            name: handle.name().to_string(),
            methods: handle.methods().into_iter().map(|m| m.name).collect(),
            last_seen: handle.last_seen(),
            is_local: true,
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

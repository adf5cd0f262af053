//! The peer wire schema: one JSON envelope per WebSocket text frame.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Ping,
    Pong,
    ServerCall,
    ServerResponse,
    RegistrySync,
    RouteMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Unique per envelope; doubles as the correlation id for
    /// `server_call`.
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Unix seconds at the sender.
    pub timestamp: u64,
    /// Node ids that have forwarded this envelope, in order.
    #[serde(default)]
    pub route: Vec<String>,
    /// Remaining hop budget.
    pub ttl: u32,
    /// For responses: the id of the envelope being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn fresh_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, from: &str, to: &str, ttl: u32) -> Envelope {
        Envelope {
            kind,
            id: fresh_id(),
            from: from.to_string(),
            to: to.to_string(),
            data: serde_json::Value::Null,
            timestamp: unix_now(),
            route: Vec::new(),
            ttl,
            reply_to: None,
        }
    }

    pub fn with_data(mut self, data: impl Serialize) -> Envelope {
        self.data = serde_json::to_value(data).unwrap_or(serde_json::Value::Null);
        self
    }

    pub fn replying_to(mut self, id: &str) -> Envelope {
        self.reply_to = Some(id.to_string());
        self
    }

    /// Wraps this envelope for multi-hop forwarding.
    pub fn wrap_for_routing(&self, local_node: &str) -> Envelope {
        Envelope::new(EnvelopeKind::RouteMessage, local_node, self.to.as_str(), self.ttl)
            .with_data(RouteMessageData {
                envelope: self.clone(),
            })
    }
}

/// Payload of a `server_call` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCallData {
    pub server_name: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    /// Whether the caller is holding a reply slot open.
    #[serde(default = "default_true")]
    pub wait: bool,
}

fn default_true() -> bool {
    true
}

/// Payload of a `server_response` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerResponseData {
    pub success: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_tag: Option<String>,
}

/// Payload of a `registry_sync` envelope: the sender's local server list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySyncData {
    pub node_id: String,
    pub servers: Vec<ServerAdvert>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerAdvert {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

/// Payload of a `route_message` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMessageData {
    pub envelope: Envelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_with_snake_case_type_tag() {
        let envelope = Envelope::new(EnvelopeKind::ServerCall, "aaaa", "bbbb", 8).with_data(
            ServerCallData {
                server_name: "counter".to_string(),
                method: "increment".to_string(),
                args: vec![serde_json::json!(5)],
                wait: true,
            },
        );

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "server_call");
        assert_eq!(json["data"]["server_name"], "counter");

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn wrapping_preserves_the_inner_envelope() {
        let inner = Envelope::new(EnvelopeKind::ServerCall, "aaaa", "cccc", 7);
        let wrapped = inner.wrap_for_routing("bbbb");
        assert_eq!(wrapped.kind, EnvelopeKind::RouteMessage);
        assert_eq!(wrapped.to, "cccc");

        let data: RouteMessageData = serde_json::from_value(wrapped.data).unwrap();
        assert_eq!(data.envelope, inner);
    }

    #[test]
    fn missing_reply_to_is_omitted_on_the_wire() {
        let envelope = Envelope::new(EnvelopeKind::Ping, "a", "b", 1);
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("reply_to").is_none());
    }
}

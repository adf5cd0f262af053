//! Metric names emitted by the federation layer.

pub const ENVELOPES_SENT: &str = "federation.peer.envelopes_sent";
pub const ENVELOPES_RECEIVED: &str = "federation.peer.envelopes_received";
pub const PEER_BACKPRESSURE: &str = "federation.peer.queue_backpressure";
pub const REMOTE_CALLS: &str = "federation.overlay.remote_calls";
pub const FLOOD_FORWARDS: &str = "federation.overlay.flood_forwards";
pub const LATE_RESPONSES: &str = "federation.overlay.late_responses_dropped";
pub const RPC_REQUESTS: &str = "federation.gateway.rpc_requests";

//! Federation layer for the Relay runtime: the JSON-RPC 2.0 gateway, the
//! registry endpoints, and the WebSocket peer overlay with multi-hop
//! routing.
//!
//! [`node::Node`] assembles the three pieces; the overlay implements the
//! runtime's `RemoteTransport` seam so router calls reach peers without
//! the language layer knowing about transports.

pub mod config;
pub mod convert;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod metrics_defs;
mod node;
pub mod overlay;
mod peer;
pub mod registry;
pub mod rpc;

pub use config::{FederationConfig, PeerSeed};
pub use error::FederationError;
pub use node::Node;
pub use overlay::Overlay;

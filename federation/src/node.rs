//! Assembly of one federated node: runtime, overlay, and gateway wired
//! together. The binary and the cluster tests both go through this.

use std::net::SocketAddr;
use std::sync::Arc;

use runtime::eval::Runtime;
use runtime::RuntimeConfig;
use tokio::task::JoinHandle;

use crate::config::FederationConfig;
use crate::error::FederationError;
use crate::gateway::{self, AppState};
use crate::overlay::Overlay;

pub struct Node {
    runtime: Runtime,
    overlay: Overlay,
    addr: SocketAddr,
    gateway: JoinHandle<()>,
}

impl Node {
    pub async fn start(
        federation: FederationConfig,
        runtime_config: RuntimeConfig,
    ) -> Result<Node, FederationError> {
        Node::start_with_runtime(Runtime::new(runtime_config), federation).await
    }

    /// Wires an existing runtime (servers may already be declared) into a
    /// fresh overlay and gateway.
    pub async fn start_with_runtime(
        runtime: Runtime,
        config: FederationConfig,
    ) -> Result<Node, FederationError> {
        let overlay = Overlay::new(runtime.clone(), config.clone());
        overlay.install();

        let state = AppState {
            runtime: runtime.clone(),
            overlay: overlay.clone(),
            config: Arc::new(config),
        };
        let (addr, gateway) = gateway::bind(state).await?;
        overlay.set_advertised_addr(addr.to_string());
        overlay.start();

        tracing::info!(node_id = %overlay.node_id(), address = %addr, "node listening");
        Ok(Node {
            runtime,
            overlay,
            addr,
            gateway,
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn node_id(&self) -> &str {
        self.overlay.node_id()
    }

    /// Stops the gateway and every local server.
    pub fn shutdown(self) {
        self.gateway.abort();
        self.runtime.shutdown();
    }
}

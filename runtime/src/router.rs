//! The uniform message router.
//!
//! `message` and `send` in programs, receiver-to-receiver calls, and the
//! JSON-RPC gateway all come through [`Router::route`]; callers cannot
//! observe whether the target server runs in this process or on a peer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::RuntimeConfig;
use crate::error::{EvalError, Result};
use crate::metrics_defs;
use crate::registry::ServerRegistry;
use crate::server::current_server;
use crate::value::Value;

/// Remote delivery seam, implemented by the peer overlay and installed at
/// startup. The router stays ignorant of transports.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// This node's stable identifier.
    fn node_id(&self) -> String;

    /// Resolves a bare server name against the synced peer catalogue.
    fn locate(&self, server: &str) -> Option<String>;

    async fn call(
        &self,
        node_id: &str,
        server: &str,
        method: &str,
        args: Vec<Value>,
        wait_for_reply: bool,
        timeout: Duration,
    ) -> Result<Value>;
}

pub struct Router {
    servers: ServerRegistry,
    config: RuntimeConfig,
    remote: RwLock<Option<Arc<dyn RemoteTransport>>>,
}

impl Router {
    pub fn new(servers: ServerRegistry, config: RuntimeConfig) -> Router {
        Router {
            servers,
            config,
            remote: RwLock::new(None),
        }
    }

    pub fn set_transport(&self, transport: Arc<dyn RemoteTransport>) {
        *self.remote.write() = Some(transport);
    }

    pub async fn route(
        &self,
        target: &str,
        method: &str,
        args: Vec<Value>,
        wait_for_reply: bool,
    ) -> Result<Value> {
        self.route_with_timeout(
            target,
            method,
            args,
            wait_for_reply,
            self.config.message_timeout(),
        )
        .await
    }

    pub async fn route_with_timeout(
        &self,
        target: &str,
        method: &str,
        args: Vec<Value>,
        wait_for_reply: bool,
        timeout: Duration,
    ) -> Result<Value> {
        if self.servers.get(target).is_some() {
            return self
                .call_local(target, method, args, wait_for_reply, timeout)
                .await;
        }

        let remote = self.remote.read().clone();
        if let Some(transport) = remote {
            // Explicit node-qualified reference: "node_id.server".
            if let Some((node_id, server)) = target.split_once('.') {
                metrics::counter!(metrics_defs::ROUTED_REMOTE).increment(1);
                return transport
                    .call(node_id, server, method, args, wait_for_reply, timeout)
                    .await;
            }
            // Bare name known from a peer's registry sync.
            if let Some(node_id) = transport.locate(target) {
                metrics::counter!(metrics_defs::ROUTED_REMOTE).increment(1);
                return transport
                    .call(&node_id, target, method, args, wait_for_reply, timeout)
                    .await;
            }
        }

        Err(EvalError::UnknownTarget(target.to_string()))
    }

    /// Local-only resolution, used by the overlay for inbound peer calls so
    /// an unresolved target errors instead of re-entering the flood.
    pub async fn call_local(
        &self,
        target: &str,
        method: &str,
        args: Vec<Value>,
        wait_for_reply: bool,
        timeout: Duration,
    ) -> Result<Value> {
        let Some(server) = self.servers.get(target) else {
            return Err(EvalError::UnknownTarget(target.to_string()));
        };

        if wait_for_reply && current_server().as_deref() == Some(target) {
            return Err(EvalError::Deadlock(target.to_string()));
        }

        metrics::counter!(metrics_defs::ROUTED_LOCAL).increment(1);
        server
            .send_message(
                method,
                args,
                wait_for_reply,
                timeout,
                self.config.enqueue_timeout(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedTransport {
        node: String,
        known: Option<(String, String)>,
    }

    #[async_trait]
    impl RemoteTransport for FixedTransport {
        fn node_id(&self) -> String {
            self.node.clone()
        }

        fn locate(&self, server: &str) -> Option<String> {
            self.known
                .as_ref()
                .filter(|(name, _)| name == server)
                .map(|(_, node)| node.clone())
        }

        async fn call(
            &self,
            node_id: &str,
            server: &str,
            _method: &str,
            _args: Vec<Value>,
            _wait: bool,
            _timeout: Duration,
        ) -> Result<Value> {
            Ok(Value::String(format!("{node_id}:{server}")))
        }
    }

    #[tokio::test]
    async fn unresolved_target_fails() {
        let router = Router::new(ServerRegistry::new(), RuntimeConfig::default());
        let error = router
            .route("ghost", "poke", vec![], true)
            .await
            .unwrap_err();
        assert!(matches!(error, EvalError::UnknownTarget(_)));
    }

    #[tokio::test]
    async fn node_qualified_target_goes_remote() {
        let router = Router::new(ServerRegistry::new(), RuntimeConfig::default());
        router.set_transport(Arc::new(FixedTransport {
            node: "aaaa".into(),
            known: None,
        }));

        let value = router
            .route("bbbb.counter", "get_count", vec![], true)
            .await
            .unwrap();
        assert_eq!(value, Value::String("bbbb:counter".into()));
    }

    #[tokio::test]
    async fn catalogued_bare_name_goes_remote() {
        let router = Router::new(ServerRegistry::new(), RuntimeConfig::default());
        router.set_transport(Arc::new(FixedTransport {
            node: "aaaa".into(),
            known: Some(("counter".into(), "cccc".into())),
        }));

        let value = router
            .route("counter", "get_count", vec![], true)
            .await
            .unwrap();
        assert_eq!(value, Value::String("cccc:counter".into()));

        let error = router
            .route("other", "get_count", vec![], true)
            .await
            .unwrap_err();
        assert!(matches!(error, EvalError::UnknownTarget(_)));
    }
}

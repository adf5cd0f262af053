//! The WebSocket peer-to-peer overlay: connection registry, response
//! correlation, bounded-flood multi-hop routing, and health pings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use runtime::error::EvalError;
use runtime::eval::Runtime;
use runtime::router::RemoteTransport;
use runtime::value::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::{FederationConfig, random_node_id};
use crate::convert::{json_args_to_values, json_to_value, value_to_json, values_to_json_args};
use crate::envelope::{
    Envelope, EnvelopeKind, RegistrySyncData, RouteMessageData, ServerAdvert, ServerCallData,
    ServerResponseData, unix_now,
};
use crate::error::FederationError;
use crate::metrics_defs;
use crate::peer::{PeerLink, frames_from_axum, frames_from_client, spawn_peer_tasks};
use crate::registry::{PeerEntry, RegistrySnapshot, ServerEntry, local_server_entries};

/// Pings-without-pong before a connection is skipped by routing.
const UNHEALTHY_AFTER_MISSED: u32 = 3;
/// Pings-without-pong before the connection is torn down.
const CLOSE_AFTER_MISSED: u32 = 6;
/// How long handled call ids are remembered so flood duplicates are
/// dropped.
const SEEN_CALL_TTL: Duration = Duration::from_secs(60);

/// A server advertised by a peer through registry sync.
#[derive(Debug, Clone)]
pub struct RemoteServer {
    pub node_id: String,
    pub methods: Vec<String>,
    pub last_seen: u64,
}

struct OverlayInner {
    node_id: String,
    config: FederationConfig,
    runtime: Runtime,
    /// Gateway address advertised in registry snapshots.
    advertised_addr: RwLock<String>,
    /// Live connections, keyed by peer node id.
    peers: RwLock<HashMap<String, Arc<PeerLink>>>,
    /// Reply slots for outbound calls, keyed by correlation id.
    pending: Mutex<HashMap<String, oneshot::Sender<ServerResponseData>>>,
    /// Recently handled inbound call ids (flood duplicate suppression).
    seen_calls: Mutex<HashMap<String, Instant>>,
    /// Peer server catalogue, keyed by server name.
    catalogue: RwLock<HashMap<String, RemoteServer>>,
}

#[derive(Clone)]
pub struct Overlay {
    inner: Arc<OverlayInner>,
}

impl Overlay {
    pub fn new(runtime: Runtime, config: FederationConfig) -> Overlay {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(random_node_id);
        let advertised = format!("{}:{}", config.host, config.port);
        Overlay {
            inner: Arc::new(OverlayInner {
                node_id,
                config,
                runtime,
                advertised_addr: RwLock::new(advertised),
                peers: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                seen_calls: Mutex::new(HashMap::new()),
                catalogue: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn config(&self) -> &FederationConfig {
        &self.inner.config
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    pub fn set_advertised_addr(&self, addr: impl Into<String>) {
        *self.inner.advertised_addr.write() = addr.into();
    }

    /// Installs this overlay as the runtime's remote transport.
    pub fn install(&self) {
        self.inner
            .runtime
            .set_transport(Arc::new(self.clone()) as Arc<dyn RemoteTransport>);
    }

    /// Dials configured peers and starts the health/registry ticker.
    pub fn start(&self) {
        for seed in self.inner.config.peers_on_start.clone() {
            let overlay = self.clone();
            tokio::spawn(async move {
                for attempt in 1..=3u32 {
                    match overlay.connect_to_peer(&seed.address, &seed.node_id).await {
                        Ok(()) => return,
                        Err(e) => {
                            tracing::warn!(
                                peer = %seed.node_id,
                                address = %seed.address,
                                attempt,
                                error = %e,
                                "startup peer dial failed"
                            );
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            });
        }

        let overlay = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(overlay.inner.config.discovery_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so freshly dialed
            // peers are not pinged before the handshake settles.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                overlay.health_tick().await;
            }
        });
    }

    /// Registers an inbound connection accepted on `/ws/p2p`.
    pub fn accept_inbound(&self, socket: axum::extract::ws::WebSocket, peer_node_id: String) {
        let (sink, stream) = frames_from_axum(socket);
        self.register_link(peer_node_id, None, sink, stream);
    }

    /// Dials a peer's gateway and registers the connection.
    pub async fn connect_to_peer(
        &self,
        address: &str,
        node_id: &str,
    ) -> Result<(), FederationError> {
        let url = peer_ws_url(address, &self.inner.node_id)?;
        let connect = tokio_tungstenite::connect_async(url.as_str());
        let (socket, _response) =
            tokio::time::timeout(self.inner.config.read_timeout(), connect)
                .await
                .map_err(|_| {
                    FederationError::WebSocket(format!("connect to {address} timed out"))
                })?
                .map_err(|e| FederationError::WebSocket(e.to_string()))?;

        let (sink, stream) = frames_from_client(socket);
        self.register_link(node_id.to_string(), Some(address.to_string()), sink, stream);
        Ok(())
    }

    fn register_link(
        &self,
        node_id: String,
        address: Option<String>,
        sink: crate::peer::FrameSink,
        stream: crate::peer::FrameStream,
    ) {
        let (tx, rx) = mpsc::channel(self.inner.config.peer_queue_capacity);
        let (closing_tx, closing_rx) = watch::channel(false);
        let link = Arc::new(PeerLink::new(
            node_id.clone(),
            address,
            tx,
            Duration::from_secs(1),
            closing_tx,
        ));

        if let Some(previous) = self.inner.peers.write().insert(node_id.clone(), link.clone()) {
            tracing::debug!(peer = %node_id, "replacing existing peer connection");
            previous.close();
        }

        spawn_peer_tasks(
            self.clone(),
            link.clone(),
            sink,
            stream,
            rx,
            closing_rx,
            self.inner.config.write_timeout(),
        );
        tracing::info!(peer = %node_id, "peer connection established");

        // Advertise our servers right away so the peer's catalogue fills
        // without waiting a discovery interval.
        let sync = self.registry_sync_envelope(&node_id);
        tokio::spawn(async move {
            let _ = link.enqueue(sync).await;
        });
    }

    /// Tears down the connection to one peer. Returns false when none
    /// exists.
    pub fn disconnect(&self, node_id: &str) -> bool {
        let removed = self.inner.peers.write().remove(node_id);
        match removed {
            Some(link) => {
                link.close();
                self.inner
                    .catalogue
                    .write()
                    .retain(|_, remote| remote.node_id != node_id);
                tracing::info!(peer = %node_id, "peer disconnected");
                true
            }
            None => false,
        }
    }

    /// Called by reader/writer tasks when their connection dies.
    pub(crate) fn connection_lost(&self, link: &Arc<PeerLink>) {
        let mut peers = self.inner.peers.write();
        let is_current = peers
            .get(link.node_id())
            .is_some_and(|current| Arc::ptr_eq(current, link));
        if is_current {
            peers.remove(link.node_id());
            drop(peers);
            link.close();
            self.inner
                .catalogue
                .write()
                .retain(|_, remote| remote.node_id != link.node_id());
            tracing::info!(peer = %link.node_id(), "peer connection closed");
        }
    }

    /// Handler table for inbound envelopes.
    pub(crate) async fn handle_envelope(&self, link: &Arc<PeerLink>, envelope: Envelope) {
        link.touch();
        match envelope.kind {
            EnvelopeKind::Ping => {
                let pong = Envelope::new(EnvelopeKind::Pong, &self.inner.node_id, &envelope.from, 1)
                    .replying_to(&envelope.id);
                let _ = link.enqueue(pong).await;
            }
            EnvelopeKind::Pong => link.mark_pong(),
            EnvelopeKind::RegistrySync => self.handle_registry_sync(link, envelope),
            EnvelopeKind::RouteMessage => {
                match serde_json::from_value::<RouteMessageData>(envelope.data) {
                    Ok(data) => self.route_envelope(data.envelope).await,
                    Err(e) => {
                        tracing::warn!(peer = %link.node_id(), error = %e, "malformed route_message dropped");
                    }
                }
            }
            EnvelopeKind::ServerCall | EnvelopeKind::ServerResponse => {
                self.route_envelope(envelope).await;
            }
        }
    }

    /// Applies the routing algorithm to an envelope that may or may not be
    /// addressed to this node.
    pub(crate) async fn route_envelope(&self, envelope: Envelope) {
        if envelope.to == self.inner.node_id {
            match envelope.kind {
                EnvelopeKind::ServerCall => {
                    // Run the call off the reader task so a slow receiver
                    // cannot stall the connection.
                    let overlay = self.clone();
                    tokio::spawn(async move { overlay.process_server_call(envelope).await });
                }
                EnvelopeKind::ServerResponse => self.handle_server_response(envelope),
                other => {
                    tracing::debug!(kind = ?other, "unroutable envelope for this node dropped");
                }
            }
            return;
        }

        if let Err(e) = self.deliver(envelope).await {
            tracing::debug!(error = %e, "transit envelope dropped");
        }
    }

    /// Sends an envelope toward `to`: a direct healthy connection wins,
    /// otherwise the envelope floods to every healthy neighbour not
    /// already on its route, with the TTL bounding total hops. The local
    /// node id is appended to the route either way.
    pub(crate) async fn deliver(&self, mut envelope: Envelope) -> Result<(), EvalError> {
        if envelope.route.last() != Some(&self.inner.node_id) {
            envelope.route.push(self.inner.node_id.clone());
        }

        let direct = self.inner.peers.read().get(&envelope.to).cloned();
        if let Some(link) = direct {
            if link.is_healthy() {
                return link.enqueue(envelope).await;
            }
        }

        envelope.ttl = envelope.ttl.saturating_sub(1);
        if envelope.ttl == 0 {
            return Err(EvalError::TtlExceeded(format!("node {}", envelope.to)));
        }

        let neighbours: Vec<Arc<PeerLink>> = self
            .inner
            .peers
            .read()
            .values()
            .filter(|link| link.is_healthy())
            .filter(|link| !envelope.route.iter().any(|hop| hop == link.node_id()))
            .cloned()
            .collect();

        if neighbours.is_empty() {
            return Err(EvalError::UnknownTarget(format!(
                "no route to node {}",
                envelope.to
            )));
        }

        let mut forwarded = false;
        for link in neighbours {
            let wrapped = envelope.wrap_for_routing(&self.inner.node_id);
            if link.enqueue(wrapped).await.is_ok() {
                forwarded = true;
                metrics::counter!(metrics_defs::FLOOD_FORWARDS).increment(1);
            }
        }
        if forwarded {
            Ok(())
        } else {
            Err(EvalError::Backpressure(format!(
                "all peer queues full toward node {}",
                envelope.to
            )))
        }
    }

    /// Executes an inbound `server_call` against a local server and sends
    /// the response back toward the caller.
    async fn process_server_call(&self, envelope: Envelope) {
        {
            let mut seen = self.inner.seen_calls.lock();
            if seen.contains_key(&envelope.id) {
                tracing::debug!(id = %envelope.id, "duplicate server_call dropped");
                return;
            }
            seen.insert(envelope.id.clone(), Instant::now());
        }

        let data: ServerCallData = match serde_json::from_value(envelope.data.clone()) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "malformed server_call dropped");
                return;
            }
        };

        let outcome = match json_args_to_values(&data.args, self.inner.runtime.structs()) {
            Ok(args) => {
                self.inner
                    .runtime
                    .router()
                    .call_local(
                        &data.server_name,
                        &data.method,
                        args,
                        data.wait,
                        self.inner.runtime.config().message_timeout(),
                    )
                    .await
            }
            Err(e) => Err(EvalError::TypeMismatch(e.to_string())),
        };

        if !data.wait {
            return;
        }

        let response_data = match outcome {
            Ok(value) => ServerResponseData {
                success: true,
                result: value_to_json(&value),
                error: None,
                error_tag: None,
            },
            Err(error) => ServerResponseData {
                success: false,
                result: serde_json::Value::Null,
                error: Some(error.to_string()),
                error_tag: Some(error.tag().to_string()),
            },
        };

        let response = Envelope::new(
            EnvelopeKind::ServerResponse,
            &self.inner.node_id,
            &envelope.from,
            self.inner.config.ttl_default,
        )
        .replying_to(&envelope.id)
        .with_data(response_data);

        if let Err(e) = self.deliver(response).await {
            tracing::warn!(
                caller = %envelope.from,
                error = %e,
                "failed to route server_response back to caller"
            );
        }
    }

    /// Completes the pending reply slot for a response. Late or unknown
    /// correlations are dropped.
    fn handle_server_response(&self, envelope: Envelope) {
        let Some(correlation) = envelope.reply_to.clone() else {
            tracing::debug!("server_response without reply_to dropped");
            return;
        };
        let data: ServerResponseData = match serde_json::from_value(envelope.data) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "malformed server_response dropped");
                return;
            }
        };
        match self.inner.pending.lock().remove(&correlation) {
            Some(slot) => {
                let _ = slot.send(data);
            }
            None => {
                metrics::counter!(metrics_defs::LATE_RESPONSES).increment(1);
                tracing::debug!(id = %correlation, "late server_response dropped");
            }
        }
    }

    fn handle_registry_sync(&self, link: &Arc<PeerLink>, envelope: Envelope) {
        let data: RegistrySyncData = match serde_json::from_value(envelope.data) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(peer = %link.node_id(), error = %e, "malformed registry_sync dropped");
                return;
            }
        };

        link.set_server_count(data.servers.len());
        let now = unix_now();
        let mut catalogue = self.inner.catalogue.write();
        catalogue.retain(|_, remote| remote.node_id != data.node_id);
        for advert in data.servers {
            catalogue.insert(
                advert.name,
                RemoteServer {
                    node_id: data.node_id.clone(),
                    methods: advert.methods,
                    last_seen: now,
                },
            );
        }
    }

    fn registry_sync_envelope(&self, to: &str) -> Envelope {
        let servers: Vec<ServerAdvert> = self
            .inner
            .runtime
            .servers()
            .handles()
            .into_iter()
            .map(|handle| ServerAdvert {
                name: handle.name().to_string(),
                methods: handle.methods().into_iter().map(|m| m.name).collect(),
            })
            .collect();
        Envelope::new(EnvelopeKind::RegistrySync, &self.inner.node_id, to, 1).with_data(
            RegistrySyncData {
                node_id: self.inner.node_id.clone(),
                servers,
            },
        )
    }

    /// One pass of the periodic ticker: prune the duplicate-call table,
    /// demote or close unresponsive peers, ping the rest, and push
    /// registry sync.
    async fn health_tick(&self) {
        self.inner
            .seen_calls
            .lock()
            .retain(|_, seen_at| seen_at.elapsed() < SEEN_CALL_TTL);

        let links: Vec<Arc<PeerLink>> = self.inner.peers.read().values().cloned().collect();
        for link in links {
            let missed = link.missed_pongs();
            if missed >= CLOSE_AFTER_MISSED {
                tracing::warn!(peer = %link.node_id(), missed, "closing unresponsive peer connection");
                self.disconnect(link.node_id());
                continue;
            }
            if missed >= UNHEALTHY_AFTER_MISSED && link.is_healthy() {
                tracing::warn!(peer = %link.node_id(), missed, "peer unresponsive, marking unhealthy");
                link.set_healthy(false);
            }

            link.record_ping_sent();
            let ping = Envelope::new(EnvelopeKind::Ping, &self.inner.node_id, link.node_id(), 1);
            let _ = link.enqueue(ping).await;

            let sync = self.registry_sync_envelope(link.node_id());
            let _ = link.enqueue(sync).await;
        }
    }

    /// Issues a `server_call` to a node, registering a reply slot when the
    /// caller waits. Calls addressed to this node short-circuit to the
    /// local registry.
    pub async fn call_node(
        &self,
        node_id: &str,
        server: &str,
        method: &str,
        args: Vec<Value>,
        wait_for_reply: bool,
        timeout: Duration,
    ) -> Result<Value, EvalError> {
        if node_id == self.inner.node_id {
            return self
                .inner
                .runtime
                .router()
                .call_local(server, method, args, wait_for_reply, timeout)
                .await;
        }

        metrics::counter!(metrics_defs::REMOTE_CALLS).increment(1);

        let envelope = Envelope::new(
            EnvelopeKind::ServerCall,
            &self.inner.node_id,
            node_id,
            self.inner.config.ttl_default,
        )
        .with_data(ServerCallData {
            server_name: server.to_string(),
            method: method.to_string(),
            args: values_to_json_args(&args),
            wait: wait_for_reply,
        });
        let correlation = envelope.id.clone();

        let reply_slot = if wait_for_reply {
            let (tx, rx) = oneshot::channel();
            self.inner.pending.lock().insert(correlation.clone(), tx);
            Some(rx)
        } else {
            None
        };

        if let Err(e) = self.deliver(envelope).await {
            self.inner.pending.lock().remove(&correlation);
            return Err(e);
        }

        let Some(rx) = reply_slot else {
            return Ok(Value::Nil);
        };

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(EvalError::Timeout(format!(
                    "response from {node_id}.{server}"
                )));
            }
            Err(_) => {
                // Unregister so a late arrival is dropped instead of
                // fulfilling a dead slot.
                self.inner.pending.lock().remove(&correlation);
                return Err(EvalError::Timeout(format!(
                    "response from {node_id}.{server}"
                )));
            }
        };

        if response.success {
            json_to_value(&response.result, self.inner.runtime.structs()).map_err(|e| {
                EvalError::RemoteError {
                    tag: "TypeMismatch".to_string(),
                    message: e.to_string(),
                }
            })
        } else {
            let tag = response.error_tag.as_deref().unwrap_or("RemoteError");
            let message = response
                .error
                .unwrap_or_else(|| "remote failure".to_string());
            Err(EvalError::from_remote(tag, message))
        }
    }

    pub fn peers_snapshot(&self) -> Vec<PeerEntry> {
        let mut peers: Vec<PeerEntry> = self
            .inner
            .peers
            .read()
            .values()
            .map(|link| PeerEntry {
                node_id: link.node_id().to_string(),
                address: link.address().map(str::to_string),
                last_seen: link.last_seen(),
                is_healthy: link.is_healthy(),
                server_count: link.server_count(),
            })
            .collect();
        peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        peers
    }

    /// Servers advertised by peers, for registry listings.
    pub fn remote_server_entries(&self) -> Vec<ServerEntry> {
        let mut entries: Vec<ServerEntry> = self
            .inner
            .catalogue
            .read()
            .iter()
            .map(|(name, remote)| ServerEntry {
                name: name.clone(),
                methods: remote.methods.clone(),
                last_seen: remote.last_seen,
                is_local: false,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn registry_snapshot(&self) -> RegistrySnapshot {
        let mut servers = local_server_entries(&self.inner.runtime);
        servers.extend(self.remote_server_entries());
        RegistrySnapshot {
            node_id: self.inner.node_id.clone(),
            node_address: self.inner.advertised_addr.read().clone(),
            local_servers: servers,
            peers: self.peers_snapshot(),
            timestamp: unix_now(),
        }
    }
}

fn peer_ws_url(address: &str, self_node_id: &str) -> Result<String, FederationError> {
    let base = if address.starts_with("ws://") || address.starts_with("wss://") {
        address.to_string()
    } else {
        format!("ws://{address}")
    };
    let mut url = url::Url::parse(&base)
        .map_err(|e| FederationError::Address(format!("{address}: {e}")))?;
    url.set_path("/ws/p2p");
    url.set_query(Some(&format!("node_id={self_node_id}")));
    Ok(url.to_string())
}

#[async_trait]
impl RemoteTransport for Overlay {
    fn node_id(&self) -> String {
        self.inner.node_id.clone()
    }

    fn locate(&self, server: &str) -> Option<String> {
        self.inner
            .catalogue
            .read()
            .get(server)
            .map(|remote| remote.node_id.clone())
    }

    async fn call(
        &self,
        node_id: &str,
        server: &str,
        method: &str,
        args: Vec<Value>,
        wait_for_reply: bool,
        timeout: Duration,
    ) -> runtime::Result<Value> {
        self.call_node(node_id, server, method, args, wait_for_reply, timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime::RuntimeConfig;

    /// A fake registered connection whose outbound frames land in an
    /// inspectable queue.
    fn fake_link(
        overlay: &Overlay,
        node_id: &str,
    ) -> (Arc<PeerLink>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(100);
        let (closing, _) = watch::channel(false);
        let link = Arc::new(PeerLink::new(
            node_id.to_string(),
            None,
            tx,
            Duration::from_secs(1),
            closing,
        ));
        overlay
            .inner
            .peers
            .write()
            .insert(node_id.to_string(), link.clone());
        (link, rx)
    }

    fn overlay_with_id(node_id: &str) -> Overlay {
        let config = FederationConfig {
            node_id: Some(node_id.to_string()),
            ..FederationConfig::default()
        };
        Overlay::new(Runtime::new(RuntimeConfig::default()), config)
    }

    #[tokio::test]
    async fn direct_delivery_appends_the_local_node_to_the_route() {
        let overlay = overlay_with_id("aaaa");
        let (_link, mut rx) = fake_link(&overlay, "bbbb");

        let call = Envelope::new(EnvelopeKind::ServerCall, "aaaa", "bbbb", 8);
        overlay.deliver(call).await.unwrap();

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.kind, EnvelopeKind::ServerCall);
        assert_eq!(sent.route, vec!["aaaa".to_string()]);
        assert_eq!(sent.ttl, 8);
    }

    #[tokio::test]
    async fn flood_wraps_decrements_ttl_and_skips_routed_nodes() {
        let overlay = overlay_with_id("bbbb");
        let (_to_a, mut rx_a) = fake_link(&overlay, "aaaa");
        let (_to_d, mut rx_d) = fake_link(&overlay, "dddd");

        // Envelope heading for cccc that already passed through aaaa.
        let mut call = Envelope::new(EnvelopeKind::ServerCall, "aaaa", "cccc", 8);
        call.route = vec!["aaaa".to_string()];
        overlay.deliver(call).await.unwrap();

        // aaaa is on the route already: nothing goes back.
        assert!(rx_a.try_recv().is_err());

        let wrapped = rx_d.recv().await.unwrap();
        assert_eq!(wrapped.kind, EnvelopeKind::RouteMessage);
        let inner: RouteMessageData = serde_json::from_value(wrapped.data).unwrap();
        assert_eq!(inner.envelope.ttl, 7);
        assert_eq!(
            inner.envelope.route,
            vec!["aaaa".to_string(), "bbbb".to_string()]
        );
    }

    #[tokio::test]
    async fn ttl_exhaustion_fails_instead_of_flooding() {
        let overlay = overlay_with_id("aaaa");
        let (_to_b, mut rx_b) = fake_link(&overlay, "bbbb");

        let call = Envelope::new(EnvelopeKind::ServerCall, "aaaa", "cccc", 1);
        let error = overlay.deliver(call).await.unwrap_err();
        assert!(matches!(error, EvalError::TtlExceeded(_)));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unhealthy_connections_are_skipped() {
        let overlay = overlay_with_id("aaaa");
        let (to_c, mut rx_c) = fake_link(&overlay, "cccc");
        let (_to_b, mut rx_b) = fake_link(&overlay, "bbbb");
        to_c.set_healthy(false);

        let call = Envelope::new(EnvelopeKind::ServerCall, "aaaa", "cccc", 8);
        overlay.deliver(call).await.unwrap();

        // The direct link is unhealthy, so the call floods through bbbb.
        assert!(rx_c.try_recv().is_err());
        let wrapped = rx_b.recv().await.unwrap();
        assert_eq!(wrapped.kind, EnvelopeKind::RouteMessage);
    }

    #[tokio::test]
    async fn two_hop_route_records_both_forwarders() {
        // A --- B --- C, no direct A-C connection: B forwards the call and
        // C's copy carries [A, B].
        let overlay_a = overlay_with_id("aaaa");
        let overlay_b = overlay_with_id("bbbb");
        let (_a_to_b, mut rx_ab) = fake_link(&overlay_a, "bbbb");
        let (b_to_a, _rx_ba) = fake_link(&overlay_b, "aaaa");
        let (_b_to_c, mut rx_bc) = fake_link(&overlay_b, "cccc");

        let call = Envelope::new(EnvelopeKind::ServerCall, "aaaa", "cccc", 8);
        overlay_a.deliver(call).await.unwrap();

        // Hand the wrapper A emitted to B, as B's reader task would.
        let wrapped = rx_ab.recv().await.unwrap();
        assert_eq!(wrapped.kind, EnvelopeKind::RouteMessage);
        overlay_b.handle_envelope(&b_to_a, wrapped).await;

        let at_c = rx_bc.recv().await.unwrap();
        assert_eq!(at_c.kind, EnvelopeKind::ServerCall);
        assert_eq!(at_c.route, vec!["aaaa".to_string(), "bbbb".to_string()]);
    }

    #[tokio::test]
    async fn late_responses_are_dropped() {
        let overlay = overlay_with_id("aaaa");
        // No pending slot registered for this correlation id.
        let response = Envelope::new(EnvelopeKind::ServerResponse, "bbbb", "aaaa", 8)
            .replying_to("0000000000000001")
            .with_data(ServerResponseData {
                success: true,
                result: serde_json::json!(1),
                error: None,
                error_tag: None,
            });
        // Must not panic or hang.
        overlay.route_envelope(response).await;
        assert!(overlay.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn registry_sync_fills_the_catalogue_for_locate() {
        let overlay = overlay_with_id("aaaa");
        let (link, _rx) = fake_link(&overlay, "bbbb");

        let sync = Envelope::new(EnvelopeKind::RegistrySync, "bbbb", "aaaa", 1).with_data(
            RegistrySyncData {
                node_id: "bbbb".to_string(),
                servers: vec![ServerAdvert {
                    name: "counter".to_string(),
                    methods: vec!["increment".to_string()],
                }],
            },
        );
        overlay.handle_envelope(&link, sync).await;

        assert_eq!(overlay.locate("counter"), Some("bbbb".to_string()));
        assert_eq!(overlay.locate("other"), None);
        assert_eq!(link.server_count(), 1);

        // Disconnect drops the peer's catalogue entries.
        overlay.disconnect("bbbb");
        assert_eq!(overlay.locate("counter"), None);
    }
}

//! One peer connection: a bounded send queue drained by a writer task and
//! a reader task feeding envelopes to the overlay's handler table.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use runtime::error::EvalError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::watch;

use crate::envelope::{Envelope, unix_now};
use crate::error::FederationError;
use crate::metrics_defs;
use crate::overlay::Overlay;

pub(crate) type FrameSink = Pin<Box<dyn Sink<String, Error = FederationError> + Send>>;
pub(crate) type FrameStream =
    Pin<Box<dyn Stream<Item = Result<String, FederationError>> + Send>>;

/// Adapts an inbound (axum) WebSocket into text-frame halves.
pub(crate) fn frames_from_axum(socket: axum::extract::ws::WebSocket) -> (FrameSink, FrameStream) {
    use axum::extract::ws::Message;

    let (sink, stream) = socket.split();
    let sink = sink.with(|text: String| async move {
        Ok::<Message, FederationError>(Message::Text(text.into()))
    });
    let stream = stream.filter_map(|frame| async move {
        match frame {
            Ok(Message::Text(text)) => Some(Ok(text.to_string())),
            Ok(Message::Close(_)) => Some(Err(FederationError::ConnectionClosed)),
            // Transport-level ping/pong is handled underneath us.
            Ok(_) => None,
            Err(e) => Some(Err(FederationError::WebSocket(e.to_string()))),
        }
    });
    (Box::pin(sink), Box::pin(stream))
}

/// Adapts an outbound (tungstenite) WebSocket into text-frame halves.
pub(crate) fn frames_from_client(
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> (FrameSink, FrameStream) {
    use tokio_tungstenite::tungstenite::Message;

    let (sink, stream) = socket.split();
    let sink = sink
        .with(|text: String| async move { Ok::<Message, FederationError>(Message::Text(text)) });
    let stream = stream.filter_map(|frame| async move {
        match frame {
            Ok(Message::Text(text)) => Some(Ok(text)),
            Ok(Message::Close(_)) => Some(Err(FederationError::ConnectionClosed)),
            Ok(_) => None,
            Err(e) => Some(Err(FederationError::WebSocket(e.to_string()))),
        }
    });
    (Box::pin(sink), Box::pin(stream))
}

/// Liveness bookkeeping and the send queue for one connected peer.
pub struct PeerLink {
    node_id: String,
    /// Dial address when this side initiated the connection.
    address: Option<String>,
    tx: mpsc::Sender<Envelope>,
    enqueue_timeout: Duration,
    /// Flipped to true to make the reader and writer tasks drop the
    /// socket.
    closing: watch::Sender<bool>,
    last_seen: AtomicU64,
    missed_pongs: AtomicU32,
    healthy: AtomicBool,
    server_count: AtomicUsize,
}

impl PeerLink {
    pub(crate) fn new(
        node_id: String,
        address: Option<String>,
        tx: mpsc::Sender<Envelope>,
        enqueue_timeout: Duration,
        closing: watch::Sender<bool>,
    ) -> PeerLink {
        PeerLink {
            node_id,
            address,
            tx,
            enqueue_timeout,
            closing,
            last_seen: AtomicU64::new(unix_now()),
            missed_pongs: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
            server_count: AtomicUsize::new(0),
        }
    }

    /// Signals both connection tasks to stop and drop the socket.
    pub fn close(&self) {
        let _ = self.closing.send(true);
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn touch(&self) {
        self.last_seen.store(unix_now(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    /// A pong arrived: the peer is alive again.
    pub fn mark_pong(&self) {
        self.missed_pongs.store(0, Ordering::Relaxed);
        self.healthy.store(true, Ordering::Relaxed);
    }

    /// Called when a ping goes out; returns the count of pings since the
    /// last pong.
    pub fn record_ping_sent(&self) -> u32 {
        self.missed_pongs.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs.load(Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn server_count(&self) -> usize {
        self.server_count.load(Ordering::Relaxed)
    }

    pub fn set_server_count(&self, count: usize) {
        self.server_count.store(count, Ordering::Relaxed);
    }

    /// Bounded enqueue onto the connection's send queue.
    pub async fn enqueue(&self, envelope: Envelope) -> Result<(), EvalError> {
        self.tx
            .send_timeout(envelope, self.enqueue_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => {
                    metrics::counter!(metrics_defs::PEER_BACKPRESSURE).increment(1);
                    EvalError::Backpressure(format!("peer {}", self.node_id))
                }
                SendTimeoutError::Closed(_) => {
                    EvalError::UnknownTarget(format!("peer {} disconnected", self.node_id))
                }
            })
    }
}

/// Spawns the writer and reader tasks for a registered connection. Both
/// exit when the link is closed or the socket drops; whichever side ends
/// first reports the loss to the overlay, which closes the other.
pub(crate) fn spawn_peer_tasks(
    overlay: Overlay,
    link: Arc<PeerLink>,
    sink: FrameSink,
    stream: FrameStream,
    queue: mpsc::Receiver<Envelope>,
    closing: watch::Receiver<bool>,
    write_timeout: Duration,
) {
    let writer_overlay = overlay.clone();
    let writer_link = link.clone();
    let mut writer_closing = closing.clone();
    tokio::spawn(async move {
        let mut sink = sink;
        let mut queue = queue;
        loop {
            let envelope = tokio::select! {
                _ = writer_closing.changed() => break,
                maybe = queue.recv() => match maybe {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(peer = %writer_link.node_id(), error = %e, "unserializable envelope dropped");
                    continue;
                }
            };
            match tokio::time::timeout(write_timeout, sink.send(text)).await {
                Ok(Ok(())) => {
                    metrics::counter!(metrics_defs::ENVELOPES_SENT).increment(1);
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer = %writer_link.node_id(), error = %e, "peer write failed");
                    break;
                }
                Err(_) => {
                    tracing::warn!(peer = %writer_link.node_id(), "peer write timed out");
                    break;
                }
            }
        }
        writer_overlay.connection_lost(&writer_link);
    });

    let mut reader_closing = closing;
    tokio::spawn(async move {
        let mut stream = stream;
        loop {
            let frame = tokio::select! {
                _ = reader_closing.changed() => break,
                maybe = stream.next() => match maybe {
                    Some(frame) => frame,
                    None => break,
                },
            };
            match frame {
                Ok(text) => match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => {
                        metrics::counter!(metrics_defs::ENVELOPES_RECEIVED).increment(1);
                        overlay.handle_envelope(&link, envelope).await;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %link.node_id(), error = %e, "malformed envelope dropped");
                    }
                },
                Err(FederationError::ConnectionClosed) => break,
                Err(e) => {
                    tracing::debug!(peer = %link.node_id(), error = %e, "peer read failed");
                    break;
                }
            }
        }
        overlay.connection_lost(&link);
    });
}

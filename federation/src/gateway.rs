//! The HTTP surface: JSON-RPC at `/rpc`, health and info probes, the
//! registry endpoint family, and the `/ws/p2p` peer upgrade.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use runtime::eval::Runtime;

use crate::config::FederationConfig;
use crate::envelope::unix_now;
use crate::error::FederationError;
use crate::metrics_defs;
use crate::overlay::Overlay;
use crate::registry::{
    AddPeerRequest, OkResponse, RemovePeerRequest, local_server_entries,
};
use crate::rpc::handle_rpc_body;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Runtime,
    pub overlay: Overlay,
    pub config: Arc<FederationConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .route("/ws/p2p", get(ws_handler));

    if state.config.enable_registry {
        router = router
            .route("/registry", get(registry_handler))
            .route("/registry/servers", get(registry_servers_handler))
            .route("/registry/peers", get(registry_peers_handler))
            .route("/registry/peers/add", post(add_peer_handler))
            .route("/registry/peers/remove", delete(remove_peer_handler));
    }

    let enable_cors = state.config.enable_cors;
    let mut app = router.with_state(state);
    if enable_cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Binds the gateway listener and serves it on a background task. Returns
/// the bound address (useful with port 0) and the server task handle.
pub async fn bind(state: AppState) -> Result<(SocketAddr, JoinHandle<()>), FederationError> {
    let listener =
        TcpListener::bind((state.config.host.as_str(), state.config.port)).await?;
    let addr = listener.local_addr()?;
    let app = build_router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "gateway server exited");
        }
    });
    Ok((addr, handle))
}

async fn rpc_handler(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    metrics::counter!(metrics_defs::RPC_REQUESTS).increment(1);
    let response = handle_rpc_body(&state.runtime, &state.overlay, &body).await;
    Json(response).into_response()
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": unix_now(),
        "servers": state.runtime.servers().len(),
    }))
}

async fn info_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut endpoints = vec!["/rpc", "/health", "/info", "/ws/p2p"];
    if state.config.enable_registry {
        endpoints.extend([
            "/registry",
            "/registry/servers",
            "/registry/peers",
            "/registry/peers/add",
            "/registry/peers/remove",
        ]);
    }
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "node_id": state.overlay.node_id(),
        "servers": state.runtime.servers().names(),
        "endpoints": endpoints,
        "jsonrpc_version": "2.0",
    }))
}

async fn registry_handler(State(state): State<AppState>) -> Response {
    Json(state.overlay.registry_snapshot()).into_response()
}

async fn registry_servers_handler(State(state): State<AppState>) -> Response {
    Json(local_server_entries(&state.runtime)).into_response()
}

async fn registry_peers_handler(State(state): State<AppState>) -> Response {
    Json(state.overlay.peers_snapshot()).into_response()
}

async fn add_peer_handler(
    State(state): State<AppState>,
    Json(request): Json<AddPeerRequest>,
) -> Response {
    match state
        .overlay
        .connect_to_peer(&request.address, &request.node_id)
        .await
    {
        Ok(()) => Json(OkResponse { ok: true }).into_response(),
        Err(e) => {
            tracing::warn!(peer = %request.node_id, error = %e, "peer add failed");
            (StatusCode::BAD_GATEWAY, Json(OkResponse { ok: false })).into_response()
        }
    }
}

async fn remove_peer_handler(
    State(state): State<AppState>,
    Json(request): Json<RemovePeerRequest>,
) -> Response {
    let removed = state.overlay.disconnect(&request.node_id);
    if removed {
        Json(OkResponse { ok: true }).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(OkResponse { ok: false })).into_response()
    }
}

#[derive(Deserialize)]
struct WsParams {
    node_id: String,
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        state.overlay.accept_inbound(socket, params.node_id);
    })
}

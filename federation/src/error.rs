use std::io;

#[derive(thiserror::Error, Debug)]
pub enum FederationError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("peer connection closed")]
    ConnectionClosed,

    #[error("invalid peer address: {0}")]
    Address(String),
}

impl From<axum::Error> for FederationError {
    fn from(e: axum::Error) -> Self {
        FederationError::WebSocket(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FederationError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        FederationError::WebSocket(e.to_string())
    }
}

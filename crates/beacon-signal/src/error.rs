//! Relay error types

use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors raised while serving signaling connections
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("session {0} is closed")]
    SessionClosed(String),
}

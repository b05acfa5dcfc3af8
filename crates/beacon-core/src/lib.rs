//! Beacon Core - Shared configuration and error types
//!
//! This crate contains the foundational types used across all Beacon components.
//! It has no dependencies on networking code.

pub mod config;
pub mod error;

pub use config::{Config, RelayConfig, ServerConfig};
pub use error::*;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Default WebSocket upgrade path
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Default maximum inbound message size (64 KB)
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

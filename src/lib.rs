//! Room-based peer discovery and file transfer relay over QUIC
//!
//! Clients join named rooms, discover each other, forward connection
//! negotiation payloads, and move files either relayed whole (direct mode)
//! or as offset-addressed chunks reassembled by the relay (chunked mode).

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transfer;

pub use client::{ClientEvent, RelayClient, RelayClientConfig};
pub use error::{DropError, Result};
pub use server::{Hub, RelayServer, ServerConfig};
pub use transfer::{TransferManager, TransferMode, TransferPolicy, TransferState};

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a unique transfer session ID
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp in milliseconds since UNIX epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

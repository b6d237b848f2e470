//! Protocol message types for the room relay
//!
//! All message payloads that can be carried within frames. Control frames use
//! JSON; `FileChunk` has its own binary layout (see `codec`).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::transfer::{TransferMode, TransferState};

/// Relay-assigned identifier of one live connection
pub type ConnectionId = String;
/// Room name chosen by clients
pub type RoomId = String;
/// Transfer session identifier, generated by the initiator
pub type SessionId = String;

/// Sender-side chunk size used by the bundled client
pub const DEFAULT_CHUNK_SIZE: u32 = 16 * 1024;

// =============================================================================
// Control (0x00 - 0x0F)
// =============================================================================

/// Ping message for keepalive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    /// Timestamp when ping was sent (for RTT measurement)
    pub timestamp: u64,
}

/// Pong response to Ping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    /// Echo back the timestamp from Ping
    pub timestamp: u64,
}

/// Graceful disconnect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goodbye {
    pub reason: String,
}

// =============================================================================
// Room membership (0x10 - 0x1F)
// =============================================================================

/// Join (or switch to) a room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoom {
    pub room_id: RoomId,
    /// Self-generated address used for direct-channel addressing
    pub peer_address: String,
}

/// Leave the current room
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaveRoom {}

/// Public view of a room member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub connection_id: ConnectionId,
    pub peer_address: String,
}

/// Reply to a join: every other member of the room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomUsers {
    pub room_id: RoomId,
    pub peers: Vec<PeerInfo>,
}

/// What changed in a room's membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MembershipChange {
    Joined { peer: PeerInfo },
    Left { connection_id: ConnectionId },
}

/// Broadcast to the other members whenever someone joins or leaves
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipChanged {
    pub room_id: RoomId,
    pub change: MembershipChange,
    /// Members after the change, in join order
    pub members: Vec<PeerInfo>,
}

// =============================================================================
// Connection negotiation (0x20 - 0x2F)
// =============================================================================

/// Opaque negotiation payload forwarded between two members of a room.
///
/// Clients set `peer` to the target; the relay rewrites it to the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub peer: ConnectionId,
    pub payload: serde_json::Value,
}

// =============================================================================
// Transfer negotiation (0x30 - 0x3F)
// =============================================================================

/// File metadata carried by an offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    /// Size in bytes
    pub size: u64,
    pub mime_type: String,
}

/// Sender's intent to send a file to one receiver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOffer {
    pub to: ConnectionId,
    /// Generated by the relay when the client does not supply one
    pub session_id: Option<SessionId>,
    pub file: FileMeta,
    pub mode: TransferMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAccept {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReject {
    pub session_id: SessionId,
}

/// Withdraw or abort a session (either party)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCancel {
    pub session_id: SessionId,
    pub reason: Option<String>,
}

/// Whole file, base64 encoded, relayed in one message (direct mode)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePayload {
    pub session_id: SessionId,
    pub data: String,
}

/// Session details sent to the receiver of an offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOffered {
    pub session_id: SessionId,
    pub from: ConnectionId,
    pub file: FileMeta,
    pub mode: TransferMode,
    pub created_at: u64,
}

/// Sent to both participants on every state transition and on progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStateChanged {
    pub session_id: SessionId,
    pub state: TransferState,
    /// Percentage, 0..=100
    pub progress: u8,
    pub reason: Option<String>,
}

/// Reassembled or relayed file, ready for the receiver to save
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReady {
    pub session_id: SessionId,
    pub file_name: String,
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
}

// =============================================================================
// Data channel (0x40 - 0x4F)
// =============================================================================

/// Announces a chunked transfer on a data stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkedStart {
    pub session_id: SessionId,
    pub total_size: u64,
    pub chunk_size: u32,
}

/// One offset-addressed piece of a file (binary payload, see `codec`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub session_id: SessionId,
    pub offset: u64,
    pub payload: Bytes,
}

/// Explicit end-of-stream marker for a chunked transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileComplete {
    pub session_id: SessionId,
}

// =============================================================================
// Error Message (0xFF)
// =============================================================================

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Error {
    pub code: u32,
    pub message: String,
    /// Related entity (session id, room id, ...)
    pub context: Option<String>,
}

impl Error {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl From<&crate::error::DropError> for Error {
    fn from(err: &crate::error::DropError) -> Self {
        Self::new(err.code(), err.message())
    }
}

/// Serde adapter carrying raw bytes as a base64 string inside JSON
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_change_json_shape() {
        let change = MembershipChange::Left {
            connection_id: "c-1".to_string(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["kind"], "left");
        assert_eq!(json["connection_id"], "c-1");
    }

    #[test]
    fn test_transfer_ready_carries_base64() {
        let ready = TransferReady {
            session_id: "s-1".to_string(),
            file_name: "doc.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            data: Bytes::from_static(b"hello"),
        };

        let json = serde_json::to_value(&ready).unwrap();
        assert_eq!(json["data"], "aGVsbG8=");

        let decoded: TransferReady = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.data, Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_error_from_drop_error() {
        let err = crate::error::DropError::size_limit("too big");
        let wire = Error::from(&err).with_context("s-9");
        assert_eq!(wire.code, 2004);
        assert_eq!(wire.message, "too big");
        assert_eq!(wire.context.as_deref(), Some("s-9"));
    }
}

//! Transfer session state machine

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DropError, Result};
use crate::protocol::messages::{ConnectionId, FileMeta, SessionId};

/// Lifecycle state of one transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Offered,
    Accepted,
    Rejected,
    Cancelled,
    Transferring,
    Completed,
    Failed,
}

impl TransferState {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Rejected
                | TransferState::Cancelled
                | TransferState::Completed
                | TransferState::Failed
        )
    }

    /// Check whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;

        matches!(
            (self, next),
            (Offered, Accepted)
                | (Offered, Rejected)
                | (Offered, Cancelled)
                | (Accepted, Transferring)
                | (Accepted, Cancelled)
                | (Transferring, Completed)
                | (Transferring, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Offered => "offered",
            TransferState::Accepted => "accepted",
            TransferState::Rejected => "rejected",
            TransferState::Cancelled => "cancelled",
            TransferState::Transferring => "transferring",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the file bytes travel once a session is accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Whole encoded file relayed in one message
    Direct,
    /// Offset-addressed chunks over a data stream
    Chunked,
}

/// One file's journey from sender to receiver
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub session_id: SessionId,
    pub sender: ConnectionId,
    pub receiver: ConnectionId,
    pub file: FileMeta,
    pub mode: TransferMode,
    pub state: TransferState,
    pub bytes_transferred: u64,
    /// Set once a chunked transfer begins
    pub chunk_size: Option<u32>,
    pub created_at: u64,
}

impl TransferSession {
    pub fn new(
        session_id: SessionId,
        sender: ConnectionId,
        receiver: ConnectionId,
        file: FileMeta,
        mode: TransferMode,
    ) -> Self {
        Self {
            session_id,
            sender,
            receiver,
            file,
            mode,
            state: TransferState::Offered,
            bytes_transferred: 0,
            chunk_size: None,
            created_at: crate::current_timestamp(),
        }
    }

    /// Percentage of the file moved so far, `min(100, floor(bytes / size * 100))`.
    ///
    /// Empty files jump straight to 100 on completion.
    pub fn progress(&self) -> u8 {
        if self.state == TransferState::Completed {
            return 100;
        }
        if self.file.size == 0 {
            return 0;
        }

        let pct = (self.bytes_transferred as u128 * 100) / self.file.size as u128;
        pct.min(100) as u8
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: TransferState) -> Result<TransferState> {
        if !self.state.can_transition_to(next) {
            return Err(DropError::stale_state(format!(
                "session {} cannot move from {} to {}",
                self.session_id, self.state, next
            )));
        }

        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    /// Check if the connection is the sender or the receiver
    pub fn involves(&self, connection_id: &str) -> bool {
        self.sender == connection_id || self.receiver == connection_id
    }

    /// The other participant, if `connection_id` is one of them
    pub fn counterpart(&self, connection_id: &str) -> Option<&ConnectionId> {
        if self.sender == connection_id {
            Some(&self.receiver)
        } else if self.receiver == connection_id {
            Some(&self.sender)
        } else {
            None
        }
    }
}

//! Signaling relay
//!
//! Every live connection owns an unbounded outbox drained by its writer task.
//! Pushing into an outbox never waits on the recipient, and one sender's
//! pushes to one target keep their order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

use crate::error::{DropError, Result};
use crate::protocol::codec::Message;
use crate::protocol::messages::ConnectionId;

use super::room_directory::RoomDirectory;

/// Sending half of a connection's outbound queue
#[derive(Debug, Clone)]
pub struct Outbox {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbox {
    pub fn new(connection_id: ConnectionId, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { connection_id, tx }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue a message; fails only if the connection's writer is gone
    pub fn push(&self, message: Message) -> Result<()> {
        self.tx.send(message).map_err(|_| {
            DropError::relay_delivery(format!("{} is no longer connected", self.connection_id))
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Routes messages to single connections or to every member of a room
pub struct SignalingRelay {
    connections: RwLock<HashMap<ConnectionId, Outbox>>,
    directory: Arc<RoomDirectory>,
}

impl SignalingRelay {
    pub fn new(directory: Arc<RoomDirectory>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            directory,
        }
    }

    /// Register a connection and return the receiving end of its outbox
    pub async fn register(&self, connection_id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(connection_id.to_string(), tx);

        let mut connections = self.connections.write().await;
        if connections.insert(connection_id.to_string(), outbox).is_some() {
            warn!("Connection {} registered twice, replacing outbox", connection_id);
        }
        rx
    }

    /// Forget a connection; returns false if it was not registered
    pub async fn unregister(&self, connection_id: &str) -> bool {
        self.connections.write().await.remove(connection_id).is_some()
    }

    pub async fn is_connected(&self, connection_id: &str) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    pub async fn outbox(&self, connection_id: &str) -> Option<Outbox> {
        self.connections.read().await.get(connection_id).cloned()
    }

    /// Deliver a message to one connection.
    ///
    /// An unreachable target is logged and reported as `RelayDelivery`; the
    /// sender is never told directly.
    pub async fn send_to(&self, target: &str, message: Message) -> Result<()> {
        let Some(outbox) = self.outbox(target).await else {
            debug!(
                "Dropping {:?} for {}: not connected",
                message.frame_type(),
                target
            );
            return Err(DropError::relay_delivery(format!("{} is not connected", target)));
        };

        outbox.push(message).inspect_err(|e| debug!("Dropping message: {}", e))
    }

    /// Deliver a message to every member of a room except `exclude`.
    ///
    /// Fire-and-forget per recipient; returns how many were reached.
    pub async fn broadcast_to_room(
        &self,
        room_id: &str,
        exclude: Option<&str>,
        message: Message,
    ) -> usize {
        let members = self.directory.members_of(room_id).await;
        let connections = self.connections.read().await;

        let mut delivered = 0;
        for peer in members {
            if exclude == Some(peer.connection_id.as_str()) {
                continue;
            }
            match connections.get(&peer.connection_id) {
                Some(outbox) if outbox.push(message.clone()).is_ok() => delivered += 1,
                _ => debug!(
                    "Broadcast to {} in room {} dropped",
                    peer.connection_id, room_id
                ),
            }
        }
        delivered
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

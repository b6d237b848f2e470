//! Room directory
//!
//! Process-wide registry of rooms and their members. A connection is in at
//! most one room; joining another room leaves the previous one, and a room
//! that loses its last member is removed at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::current_timestamp;
use crate::protocol::messages::{ConnectionId, PeerInfo, RoomId};

/// A member of a room
#[derive(Debug, Clone)]
pub struct Peer {
    pub connection_id: ConnectionId,
    /// Self-generated address used for direct-channel addressing
    pub peer_address: String,
    pub joined_at: u64,
}

impl Peer {
    pub fn new(connection_id: ConnectionId, peer_address: String) -> Self {
        Self {
            connection_id,
            peer_address,
            joined_at: current_timestamp(),
        }
    }

    pub fn to_peer_info(&self) -> PeerInfo {
        PeerInfo {
            connection_id: self.connection_id.clone(),
            peer_address: self.peer_address.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct RoomState {
    /// Members in join order
    members: Vec<Peer>,
    /// Set when the room was removed from the directory
    closed: bool,
}

/// A room
#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    state: Mutex<RoomState>,
    pub created_at: u64,
}

impl Room {
    fn new(id: RoomId) -> Self {
        Self {
            id,
            state: Mutex::new(RoomState::default()),
            created_at: current_timestamp(),
        }
    }

    /// Get all members in join order
    pub async fn members(&self) -> Vec<Peer> {
        self.state.lock().await.members.clone()
    }
}

/// A connection leaving a room
#[derive(Debug, Clone)]
pub struct Departure {
    pub room_id: RoomId,
    pub connection_id: ConnectionId,
    /// Members still in the room, in join order
    pub remaining: Vec<Peer>,
    pub room_closed: bool,
}

/// Outcome of a join
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub room_id: RoomId,
    /// Every other member, in join order
    pub others: Vec<Peer>,
    /// The joining peer as stored
    pub joined: Peer,
    /// False when the connection was already in this room
    pub newly_joined: bool,
    /// The room left to make this join, if any
    pub departed: Option<Departure>,
}

/// Room directory tracking all rooms and memberships
pub struct RoomDirectory {
    /// All rooms indexed by room ID
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    /// Connection to room mapping
    memberships: RwLock<HashMap<ConnectionId, RoomId>>,
    created_at: Instant,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            created_at: Instant::now(),
        }
    }

    /// Join a room, leaving any previous one.
    ///
    /// Joining the room the connection is already in only refreshes its
    /// peer address.
    pub async fn join(&self, room_id: &str, connection_id: &str, peer_address: &str) -> JoinOutcome {
        let departed = match self.room_of(connection_id).await {
            Some(current) if current == room_id => None,
            Some(_) => self.leave(connection_id).await,
            None => None,
        };

        loop {
            let room = self.get_or_create_room(room_id).await;
            let mut state = room.state.lock().await;

            // Lost a race with the room being emptied and removed
            if state.closed {
                continue;
            }

            let position = state
                .members
                .iter()
                .position(|p| p.connection_id == connection_id);

            let (joined, newly_joined) = match position {
                Some(i) => {
                    let existing = &mut state.members[i];
                    existing.peer_address = peer_address.to_string();
                    (existing.clone(), false)
                }
                None => {
                    let peer = Peer::new(connection_id.to_string(), peer_address.to_string());
                    state.members.push(peer.clone());
                    (peer, true)
                }
            };

            self.memberships
                .write()
                .await
                .insert(connection_id.to_string(), room_id.to_string());

            let others = state
                .members
                .iter()
                .filter(|p| p.connection_id != connection_id)
                .cloned()
                .collect();

            if newly_joined {
                info!("{} joined room {}", connection_id, room_id);
            } else {
                debug!("{} refreshed its address in room {}", connection_id, room_id);
            }

            return JoinOutcome {
                room_id: room_id.to_string(),
                others,
                joined,
                newly_joined,
                departed,
            };
        }
    }

    /// Remove a connection from its room. Safe to call repeatedly.
    pub async fn leave(&self, connection_id: &str) -> Option<Departure> {
        let room_id = self.memberships.write().await.remove(connection_id)?;
        let room = self.get_room(&room_id).await?;

        let (remaining, now_empty) = {
            let mut state = room.state.lock().await;
            let before = state.members.len();
            state.members.retain(|p| p.connection_id != connection_id);
            if state.members.len() == before {
                return None;
            }
            (state.members.clone(), state.members.is_empty())
        };

        let room_closed = now_empty && self.remove_if_empty(&room_id).await;
        info!("{} left room {}", connection_id, room_id);

        Some(Departure {
            room_id,
            connection_id: connection_id.to_string(),
            remaining,
            room_closed,
        })
    }

    /// Get members of a room in join order
    pub async fn members_of(&self, room_id: &str) -> Vec<Peer> {
        match self.get_room(room_id).await {
            Some(room) => room.members().await,
            None => Vec::new(),
        }
    }

    /// Room a connection is currently in
    pub async fn room_of(&self, connection_id: &str) -> Option<RoomId> {
        self.memberships.read().await.get(connection_id).cloned()
    }

    /// Check if two connections currently share a room
    pub async fn share_room(&self, a: &str, b: &str) -> bool {
        let memberships = self.memberships.read().await;
        match (memberships.get(a), memberships.get(b)) {
            (Some(ra), Some(rb)) => ra == rb,
            _ => false,
        }
    }

    /// Get a room by ID
    pub async fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Get room count
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Every room with its members, sorted by room id
    pub async fn snapshot(&self) -> Vec<(RoomId, Vec<PeerInfo>)> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();

        let mut out = Vec::with_capacity(rooms.len());
        for room in rooms {
            let members = room.members().await.iter().map(Peer::to_peer_info).collect();
            out.push((room.id.clone(), members));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Get uptime of the directory
    pub fn uptime(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    async fn get_or_create_room(&self, room_id: &str) -> Arc<Room> {
        if let Some(room) = self.get_room(room_id).await {
            return room;
        }

        let mut rooms = self.rooms.write().await;
        Arc::clone(rooms.entry(room_id.to_string()).or_insert_with(|| {
            debug!("Created room {}", room_id);
            Arc::new(Room::new(room_id.to_string()))
        }))
    }

    async fn remove_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(room_id).cloned() else {
            return false;
        };

        let mut state = room.state.lock().await;
        if !state.members.is_empty() {
            return false;
        }

        state.closed = true;
        rooms.remove(room_id);
        debug!("Removed empty room {}", room_id);
        true
    }
}

impl Default for RoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

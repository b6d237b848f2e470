//! Message dispatch for the relay
//!
//! The hub owns the room directory, the signaling relay, the transfer
//! manager and the reassembly buffer, and maps every inbound message kind to
//! one handler. Handlers only push into connection outboxes, so the whole
//! table can be driven without a transport.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{DropError, Result};
use crate::protocol::codec::Message;
use crate::protocol::messages::*;
use crate::transfer::{
    ReassemblyBuffer, TransferManager, TransferPolicy, TransferSession, TransferState, Transition,
};

use super::relay::{Outbox, SignalingRelay};
use super::room_directory::{Departure, Peer, RoomDirectory};

/// Point-in-time counters
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: usize,
    pub active_sessions: usize,
    pub reassembling: usize,
}

/// Shared relay state and the dispatch table over it
pub struct Hub {
    directory: Arc<RoomDirectory>,
    relay: Arc<SignalingRelay>,
    transfers: Arc<TransferManager>,
    chunks: Arc<ReassemblyBuffer>,
}

impl Hub {
    pub fn new(policy: TransferPolicy) -> Self {
        let directory = Arc::new(RoomDirectory::new());
        Self {
            relay: Arc::new(SignalingRelay::new(Arc::clone(&directory))),
            directory,
            transfers: Arc::new(TransferManager::new(policy)),
            chunks: Arc::new(ReassemblyBuffer::new()),
        }
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    pub fn relay(&self) -> &Arc<SignalingRelay> {
        &self.relay
    }

    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    /// Register a new connection; the receiver yields everything addressed to it
    pub async fn connect(&self, connection_id: &str) -> mpsc::UnboundedReceiver<Message> {
        let rx = self.relay.register(connection_id).await;
        self.transfers.attach(connection_id).await;
        debug!("Connection {} attached to hub", connection_id);
        rx
    }

    /// Tear down everything a connection owns: its outbox, its room
    /// membership and its sessions. Safe to call more than once.
    ///
    /// The peer is out of the directory before any counterpart hears about
    /// the sessions it ended.
    pub async fn disconnect(&self, connection_id: &str) {
        self.relay.unregister(connection_id).await;
        let departure = self.directory.leave(connection_id).await;

        for transition in self.transfers.detach(connection_id).await {
            self.chunks.discard(&transition.session.session_id).await;
            self.announce(&transition).await;
        }

        if let Some(departure) = departure {
            self.announce_departure(&departure).await;
        }

        info!("Connection {} cleaned up", connection_id);
    }

    /// Handle one inbound message.
    ///
    /// Benign races are logged and dropped; any other failure is reported
    /// back to the sender as an `Error` frame.
    pub async fn dispatch(&self, from: &str, message: Message) {
        let kind = message.frame_type();
        let context = context_of(&message);

        if let Err(e) = self.handle(from, message).await {
            if e.is_benign() {
                debug!("Dropped {:?} from {}: {}", kind, from, e);
            } else {
                warn!("{:?} from {} failed: {}", kind, from, e);
                self.report(from, &e, context).await;
            }
        }
    }

    /// Send an `Error` frame to a connection
    pub async fn report(&self, connection_id: &str, err: &DropError, context: Option<String>) {
        let mut wire = Error::from(err);
        wire.context = context;
        let _ = self.relay.send_to(connection_id, Message::Error(wire)).await;
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            connections: self.relay.connection_count().await,
            rooms: self.directory.room_count().await,
            active_sessions: self.transfers.active_count().await,
            reassembling: self.chunks.len().await,
        }
    }

    async fn handle(&self, from: &str, message: Message) -> Result<()> {
        match message {
            Message::JoinRoom(msg) => self.on_join(from, msg).await,
            Message::LeaveRoom(_) => self.on_leave(from).await,
            Message::Signal(msg) => self.on_signal(from, msg).await,
            Message::FileOffer(msg) => self.on_offer(from, msg).await,
            Message::FileAccept(msg) => self.on_respond(from, &msg.session_id, true).await,
            Message::FileReject(msg) => self.on_respond(from, &msg.session_id, false).await,
            Message::FileCancel(msg) => self.on_cancel(from, msg).await,
            Message::FilePayload(msg) => self.on_payload(from, msg).await,
            Message::ChunkedStart(msg) => self.on_chunked_start(from, msg).await,
            Message::FileChunk(msg) => self.on_chunk(from, msg).await,
            Message::FileComplete(msg) => self.on_file_complete(from, msg).await,

            // Keepalive and close are answered by the connection itself
            Message::Ping(_) | Message::Pong(_) | Message::Goodbye(_) => Ok(()),

            other => {
                warn!(
                    "{} sent server-only frame {:?}, ignoring",
                    from,
                    other.frame_type()
                );
                Ok(())
            }
        }
    }

    // =========================================================================
    // Rooms
    // =========================================================================

    async fn on_join(&self, from: &str, msg: JoinRoom) -> Result<()> {
        let outcome = self
            .directory
            .join(&msg.room_id, from, &msg.peer_address)
            .await;

        if let Some(departure) = &outcome.departed {
            self.announce_departure(departure).await;
        }

        let reply = RoomUsers {
            room_id: outcome.room_id.clone(),
            peers: outcome.others.iter().map(Peer::to_peer_info).collect(),
        };
        let _ = self.relay.send_to(from, Message::RoomUsers(reply)).await;

        if outcome.newly_joined {
            let mut members: Vec<PeerInfo> =
                outcome.others.iter().map(Peer::to_peer_info).collect();
            members.push(outcome.joined.to_peer_info());

            let event = MembershipChanged {
                room_id: outcome.room_id.clone(),
                change: MembershipChange::Joined {
                    peer: outcome.joined.to_peer_info(),
                },
                members,
            };
            self.relay
                .broadcast_to_room(&outcome.room_id, Some(from), Message::MembershipChanged(event))
                .await;
        }

        Ok(())
    }

    async fn on_leave(&self, from: &str) -> Result<()> {
        for transition in self.transfers.abort_all_for(from, "peer left the room").await {
            self.chunks.discard(&transition.session.session_id).await;
            self.announce(&transition).await;
        }

        if let Some(departure) = self.directory.leave(from).await {
            self.announce_departure(&departure).await;
        }
        Ok(())
    }

    async fn announce_departure(&self, departure: &Departure) {
        if departure.room_closed {
            return;
        }

        let event = MembershipChanged {
            room_id: departure.room_id.clone(),
            change: MembershipChange::Left {
                connection_id: departure.connection_id.clone(),
            },
            members: departure.remaining.iter().map(Peer::to_peer_info).collect(),
        };
        self.relay
            .broadcast_to_room(
                &departure.room_id,
                Some(&departure.connection_id),
                Message::MembershipChanged(event),
            )
            .await;
    }

    // =========================================================================
    // Negotiation
    // =========================================================================

    async fn on_signal(&self, from: &str, msg: Signal) -> Result<()> {
        if msg.peer == from || !self.directory.share_room(from, &msg.peer).await {
            return Err(DropError::not_found(format!(
                "{} is not in {}'s room",
                msg.peer, from
            )));
        }

        let forwarded = Signal {
            peer: from.to_string(),
            payload: msg.payload,
        };
        self.relay.send_to(&msg.peer, Message::Signal(forwarded)).await
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    async fn on_offer(&self, from: &str, msg: FileOffer) -> Result<()> {
        // Oversized files are refused before anything reaches the receiver
        self.transfers.policy().check(&msg)?;

        if !self.directory.share_room(from, &msg.to).await {
            return Err(DropError::not_found(format!(
                "{} is not in {}'s room",
                msg.to, from
            )));
        }

        let session = self.transfers.offer(from, &msg).await?;

        let offered = TransferOffered {
            session_id: session.session_id.clone(),
            from: session.sender.clone(),
            file: session.file.clone(),
            mode: session.mode,
            created_at: session.created_at,
        };
        if let Err(e) = self
            .relay
            .send_to(&session.receiver, Message::TransferOffered(offered))
            .await
        {
            let transition = self
                .transfers
                .abort(None, &session.session_id, e.to_string())
                .await?;
            self.announce(&transition).await;
            return Ok(());
        }

        self.notify_participants(&session, state_changed(&session, None))
            .await;
        Ok(())
    }

    async fn on_respond(&self, from: &str, session_id: &str, accept: bool) -> Result<()> {
        let transition = self.transfers.respond(from, session_id, accept).await?;
        self.announce(&transition).await;
        Ok(())
    }

    async fn on_cancel(&self, from: &str, msg: FileCancel) -> Result<()> {
        let reason = msg
            .reason
            .unwrap_or_else(|| format!("cancelled by {}", from));
        let transition = self
            .transfers
            .abort(Some(from), &msg.session_id, reason)
            .await?;

        self.chunks.discard(&msg.session_id).await;
        self.announce(&transition).await;
        Ok(())
    }

    async fn on_payload(&self, from: &str, msg: FilePayload) -> Result<()> {
        let session = self.session(&msg.session_id).await?;
        let participants = [
            self.relay.outbox(&session.sender).await,
            self.relay.outbox(&session.receiver).await,
        ];
        let receiver = &participants[1];

        let decoded = STANDARD
            .decode(msg.data.as_bytes())
            .map(Bytes::from)
            .map_err(|e| DropError::serialization(format!("payload is not base64: {}", e)));

        let finished = self
            .transfers
            .begin_direct_transfer(
                from,
                &msg.session_id,
                decoded,
                |started| push_all(&participants, state_changed(&started.session, None)),
                |session, data| match receiver {
                    Some(outbox) => outbox.push(ready(session, data)),
                    None => Err(DropError::relay_delivery(format!(
                        "{} is no longer connected",
                        session.receiver
                    ))),
                },
            )
            .await?;

        self.announce(&finished).await;
        Ok(())
    }

    async fn on_chunked_start(&self, from: &str, msg: ChunkedStart) -> Result<()> {
        let transitions = self
            .transfers
            .begin_chunked_transfer(from, &msg.session_id, msg.total_size, msg.chunk_size, |s| {
                open_chunks(&self.chunks, s.session_id.clone(), s.file.size)
            })
            .await?;

        for transition in &transitions {
            self.announce(transition).await;
        }
        Ok(())
    }

    async fn on_chunk(&self, from: &str, chunk: FileChunk) -> Result<()> {
        let session_id = chunk.session_id.as_str();
        self.admit(from, session_id, chunk.payload.len()).await?;

        let progress = match self
            .chunks
            .add_chunk(session_id, chunk.offset, chunk.payload)
            .await
        {
            Ok(progress) => progress,
            Err(e @ DropError::Corruption(_)) => return self.fail_session(session_id, &e).await,
            Err(e) => return Err(e),
        };

        if let Some(snapshot) = self
            .transfers
            .record_progress(session_id, progress.received)
            .await
        {
            self.notify_participants(&snapshot, state_changed(&snapshot, None))
                .await;
        }

        if progress.is_complete() {
            self.finalize(session_id, false).await?;
        }
        Ok(())
    }

    async fn on_file_complete(&self, from: &str, msg: FileComplete) -> Result<()> {
        self.admit(from, &msg.session_id, 0).await?;
        self.finalize(&msg.session_id, true).await
    }

    /// Check a data-stream frame against its session, opening the chunk set
    /// when the frame itself begins the transfer
    async fn admit(&self, from: &str, session_id: &str, chunk_len: usize) -> Result<()> {
        let admission = self
            .transfers
            .admit_chunk(from, session_id, chunk_len, |s| {
                open_chunks(&self.chunks, s.session_id.clone(), s.file.size)
            })
            .await?;

        if let Some(started) = &admission.started {
            self.announce(started).await;
        }
        Ok(())
    }

    /// Reassemble and hand the file to the receiver. With `ended` set the
    /// sender has closed the stream, so missing bytes fail the session.
    async fn finalize(&self, session_id: &str, ended: bool) -> Result<()> {
        let data = match self.chunks.try_finalize(session_id).await {
            Ok(Some(data)) => data,
            Ok(None) if ended => {
                let err = DropError::corruption("stream ended before every byte arrived");
                return self.fail_session(session_id, &err).await;
            }
            Ok(None) => return Ok(()),
            Err(e @ DropError::Corruption(_)) => return self.fail_session(session_id, &e).await,
            Err(e) => return Err(e),
        };

        let session = self.session(session_id).await?;
        let receiver = self.relay.outbox(&session.receiver).await;

        let transition = self
            .transfers
            .complete_with(session_id, |session| match &receiver {
                Some(outbox) => outbox.push(ready(session, data)),
                None => Err(DropError::relay_delivery(format!(
                    "{} is no longer connected",
                    session.receiver
                ))),
            })
            .await?;

        self.announce(&transition).await;
        Ok(())
    }

    async fn fail_session(&self, session_id: &str, err: &DropError) -> Result<()> {
        self.chunks.discard(session_id).await;
        let transition = self.transfers.fail(session_id, err.to_string()).await?;
        self.announce(&transition).await;
        Ok(())
    }

    async fn session(&self, session_id: &str) -> Result<TransferSession> {
        self.transfers
            .get(session_id)
            .await
            .ok_or_else(|| DropError::not_found(format!("unknown session {}", session_id)))
    }

    /// Tell both participants about a transition
    async fn announce(&self, transition: &Transition) {
        let message = state_changed(&transition.session, transition.reason.clone());
        self.notify_participants(&transition.session, message).await;
    }

    async fn notify_participants(&self, session: &TransferSession, message: Message) {
        let _ = self.relay.send_to(&session.sender, message.clone()).await;
        let _ = self.relay.send_to(&session.receiver, message).await;
    }
}

fn state_changed(session: &TransferSession, reason: Option<String>) -> Message {
    Message::TransferStateChanged(TransferStateChanged {
        session_id: session.session_id.clone(),
        state: session.state,
        progress: session.progress(),
        reason,
    })
}

/// Opens the reassembly set for a session about to begin. Runs under the
/// session lock, so a concurrent disconnect discards it after, never before.
async fn open_chunks(chunks: &ReassemblyBuffer, session_id: SessionId, size: u64) -> Result<()> {
    chunks.open(&session_id, size).await
}

fn ready(session: &TransferSession, data: Bytes) -> Message {
    Message::TransferReady(TransferReady {
        session_id: session.session_id.clone(),
        file_name: session.file.name.clone(),
        mime_type: session.file.mime_type.clone(),
        data,
    })
}

fn push_all(outboxes: &[Option<Outbox>], message: Message) {
    for outbox in outboxes.iter().flatten() {
        let _ = outbox.push(message.clone());
    }
}

/// Entity an error on this message should point at
fn context_of(message: &Message) -> Option<String> {
    match message {
        Message::JoinRoom(m) => Some(m.room_id.clone()),
        Message::Signal(m) => Some(m.peer.clone()),
        Message::FileOffer(m) => m.session_id.clone().or_else(|| Some(m.file.name.clone())),
        Message::FileAccept(m) => Some(m.session_id.clone()),
        Message::FileReject(m) => Some(m.session_id.clone()),
        Message::FileCancel(m) => Some(m.session_id.clone()),
        Message::FilePayload(m) => Some(m.session_id.clone()),
        Message::ChunkedStart(m) => Some(m.session_id.clone()),
        Message::FileChunk(m) => Some(m.session_id.clone()),
        Message::FileComplete(m) => Some(m.session_id.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::MAX_FRAME_SIZE;
    use crate::transfer::TransferMode;
    use crate::transfer::manager::relayable_size;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    fn states(messages: &[Message]) -> Vec<TransferState> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::TransferStateChanged(s) => Some(s.state),
                _ => None,
            })
            .collect()
    }

    fn ready_data(messages: &[Message]) -> Option<Bytes> {
        messages.iter().find_map(|m| match m {
            Message::TransferReady(r) => Some(r.data.clone()),
            _ => None,
        })
    }

    fn join(room: &str, addr: &str) -> Message {
        Message::JoinRoom(JoinRoom {
            room_id: room.to_string(),
            peer_address: addr.to_string(),
        })
    }

    fn offer(to: &str, id: &str, name: &str, size: u64, mode: TransferMode) -> Message {
        Message::FileOffer(FileOffer {
            to: to.to_string(),
            session_id: Some(id.to_string()),
            file: FileMeta {
                name: name.to_string(),
                size,
                mime_type: "application/octet-stream".to_string(),
            },
            mode,
        })
    }

    fn accept(id: &str) -> Message {
        Message::FileAccept(FileAccept {
            session_id: id.to_string(),
        })
    }

    fn chunk(id: &str, offset: u64, payload: Vec<u8>) -> Message {
        Message::FileChunk(FileChunk {
            session_id: id.to_string(),
            offset,
            payload: Bytes::from(payload),
        })
    }

    /// Hub with `a` and `b` connected and both in room `r1`, outboxes drained
    async fn paired() -> (
        Hub,
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let hub = Hub::new(TransferPolicy::default());
        let mut a = hub.connect("a").await;
        let mut b = hub.connect("b").await;
        hub.dispatch("a", join("r1", "addr-a")).await;
        hub.dispatch("b", join("r1", "addr-b")).await;
        drain(&mut a);
        drain(&mut b);
        (hub, a, b)
    }

    /// Paired hub with an accepted chunked session `s` of `size` bytes
    async fn accepted_chunked(
        size: u64,
    ) -> (
        Hub,
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (hub, mut a, mut b) = paired().await;
        hub.dispatch("a", offer("b", "s", "video.mp4", size, TransferMode::Chunked)).await;
        hub.dispatch("b", accept("s")).await;
        drain(&mut a);
        drain(&mut b);
        (hub, a, b)
    }

    #[tokio::test]
    async fn test_join_greets_and_broadcasts() {
        let hub = Hub::new(TransferPolicy::default());
        let mut a = hub.connect("a").await;
        let mut b = hub.connect("b").await;

        hub.dispatch("a", join("r1", "addr-a")).await;
        match drain(&mut a).as_slice() {
            [Message::RoomUsers(users)] => assert!(users.peers.is_empty()),
            other => panic!("unexpected {:?}", other),
        }

        hub.dispatch("b", join("r1", "addr-b")).await;
        match drain(&mut a).as_slice() {
            [Message::MembershipChanged(event)] => {
                assert_eq!(
                    event.change,
                    MembershipChange::Joined {
                        peer: PeerInfo {
                            connection_id: "b".to_string(),
                            peer_address: "addr-b".to_string(),
                        }
                    }
                );
                assert_eq!(event.members.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        match drain(&mut b).as_slice() {
            [Message::RoomUsers(users)] => {
                assert_eq!(users.peers.len(), 1);
                assert_eq!(users.peers[0].connection_id, "a");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejoin_same_room_is_quiet() {
        let (hub, mut a, mut b) = paired().await;
        hub.dispatch("b", join("r1", "addr-b2")).await;

        assert!(drain(&mut a).is_empty());
        assert!(matches!(drain(&mut b).as_slice(), [Message::RoomUsers(_)]));
    }

    #[tokio::test]
    async fn test_direct_transfer_scenario() {
        let (hub, mut a, mut b) = paired().await;

        hub.dispatch("a", offer("b", "s1", "doc.pdf", 2048, TransferMode::Direct)).await;
        hub.dispatch("b", accept("s1")).await;
        hub.dispatch(
            "a",
            Message::FilePayload(FilePayload {
                session_id: "s1".to_string(),
                data: STANDARD.encode(vec![7u8; 2048]),
            }),
        )
        .await;

        let seen_by_b = drain(&mut b);
        assert!(matches!(seen_by_b[0], Message::TransferOffered(_)));
        assert_eq!(
            states(&seen_by_b),
            vec![
                TransferState::Offered,
                TransferState::Accepted,
                TransferState::Transferring,
                TransferState::Completed,
            ]
        );
        assert_eq!(ready_data(&seen_by_b).unwrap().len(), 2048);

        let seen_by_a = drain(&mut a);
        assert_eq!(states(&seen_by_a).last(), Some(&TransferState::Completed));
        assert!(ready_data(&seen_by_a).is_none());
        assert_eq!(hub.transfers().progress("s1").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_direct_payload_not_base64_fails() {
        let (hub, mut a, mut b) = paired().await;
        hub.dispatch("a", offer("b", "s1", "doc.pdf", 4, TransferMode::Direct)).await;
        hub.dispatch("b", accept("s1")).await;
        drain(&mut a);
        drain(&mut b);

        hub.dispatch(
            "a",
            Message::FilePayload(FilePayload {
                session_id: "s1".to_string(),
                data: "***".to_string(),
            }),
        )
        .await;

        let seen_by_b = drain(&mut b);
        assert_eq!(
            states(&seen_by_b),
            vec![TransferState::Transferring, TransferState::Failed]
        );
        assert!(ready_data(&seen_by_b).is_none());
        assert_eq!(
            states(&drain(&mut a)),
            vec![TransferState::Transferring, TransferState::Failed]
        );
    }

    #[tokio::test]
    async fn test_chunked_out_of_order_scenario() {
        let (hub, mut a, mut b) = accepted_chunked(32768).await;

        hub.dispatch(
            "a",
            Message::ChunkedStart(ChunkedStart {
                session_id: "s".to_string(),
                total_size: 32768,
                chunk_size: 16384,
            }),
        )
        .await;
        hub.dispatch("a", chunk("s", 16384, vec![2u8; 16384])).await;
        hub.dispatch("a", chunk("s", 0, vec![1u8; 16384])).await;

        let seen_by_b = drain(&mut b);
        let data = ready_data(&seen_by_b).unwrap();
        assert_eq!(data.len(), 32768);
        assert!(data[..16384].iter().all(|&x| x == 1));
        assert!(data[16384..].iter().all(|&x| x == 2));

        let progress: Vec<u8> = seen_by_b
            .iter()
            .filter_map(|m| match m {
                Message::TransferStateChanged(s) => Some(s.progress),
                _ => None,
            })
            .collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress.last(), Some(&100));
        assert_eq!(states(&seen_by_b).last(), Some(&TransferState::Completed));

        // Trailing end marker for a finished session is a stale duplicate
        hub.dispatch(
            "a",
            Message::FileComplete(FileComplete {
                session_id: "s".to_string(),
            }),
        )
        .await;
        assert!(drain(&mut a).iter().all(|m| !matches!(m, Message::Error(_))));
    }

    #[tokio::test]
    async fn test_first_chunk_starts_transfer() {
        let (hub, _a, mut b) = accepted_chunked(4).await;

        hub.dispatch("a", chunk("s", 0, vec![1, 2, 3, 4])).await;

        let seen_by_b = drain(&mut b);
        assert_eq!(
            states(&seen_by_b),
            vec![
                TransferState::Transferring,
                TransferState::Transferring,
                TransferState::Completed,
            ]
        );
        assert_eq!(&ready_data(&seen_by_b).unwrap()[..], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_overlapping_chunk_fails_both_sides() {
        let (hub, mut a, mut b) = accepted_chunked(100).await;

        hub.dispatch("a", chunk("s", 0, vec![0; 50])).await;
        hub.dispatch("a", chunk("s", 40, vec![0; 20])).await;

        assert_eq!(states(&drain(&mut a)).last(), Some(&TransferState::Failed));
        let seen_by_b = drain(&mut b);
        assert_eq!(states(&seen_by_b).last(), Some(&TransferState::Failed));
        assert!(ready_data(&seen_by_b).is_none());

        // Later chunks are stale and change nothing
        hub.dispatch("a", chunk("s", 50, vec![0; 50])).await;
        assert!(drain(&mut b).is_empty());
        assert_eq!(hub.stats().await.reassembling, 0);
    }

    #[tokio::test]
    async fn test_early_file_complete_fails() {
        let (hub, _a, mut b) = accepted_chunked(100).await;

        hub.dispatch("a", chunk("s", 0, vec![0; 50])).await;
        hub.dispatch(
            "a",
            Message::FileComplete(FileComplete {
                session_id: "s".to_string(),
            }),
        )
        .await;

        assert_eq!(states(&drain(&mut b)).last(), Some(&TransferState::Failed));
    }

    #[tokio::test]
    async fn test_empty_chunked_file_completes_on_marker() {
        let (hub, _a, mut b) = accepted_chunked(0).await;

        hub.dispatch(
            "a",
            Message::FileComplete(FileComplete {
                session_id: "s".to_string(),
            }),
        )
        .await;

        let seen_by_b = drain(&mut b);
        assert_eq!(states(&seen_by_b).last(), Some(&TransferState::Completed));
        assert!(ready_data(&seen_by_b).unwrap().is_empty());
        assert_eq!(hub.transfers().progress("s").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_receiver_disconnect_cancels_offer() {
        let (hub, mut a, _b) = paired().await;
        hub.dispatch("a", offer("b", "s1", "doc.pdf", 10, TransferMode::Direct)).await;
        drain(&mut a);

        hub.disconnect("b").await;

        let seen_by_a = drain(&mut a);
        assert_eq!(states(&seen_by_a), vec![TransferState::Cancelled]);
        assert!(seen_by_a.iter().any(|m| matches!(
            m,
            Message::MembershipChanged(MembershipChanged {
                change: MembershipChange::Left { .. },
                ..
            })
        )));

        // A late answer is dropped without touching the session
        hub.dispatch("b", accept("s1")).await;
        assert_eq!(
            hub.transfers().get("s1").await.unwrap().state,
            TransferState::Cancelled
        );
        assert!(drain(&mut a).is_empty());

        // Second cleanup emits nothing
        hub.disconnect("b").await;
        assert!(drain(&mut a).is_empty());
    }

    #[tokio::test]
    async fn test_both_disconnect_mid_transfer_fails_once() {
        let (hub, _a, mut b) = accepted_chunked(100).await;
        hub.dispatch("a", chunk("s", 0, vec![0; 10])).await;
        drain(&mut b);

        hub.disconnect("a").await;
        hub.disconnect("b").await;

        // b's queue still holds what was pushed before its own cleanup
        assert_eq!(states(&drain(&mut b)), vec![TransferState::Failed]);

        let session = hub.transfers().get("s").await.unwrap();
        assert_eq!(session.state, TransferState::Failed);
        assert_eq!(hub.stats().await.reassembling, 0);
        assert_eq!(hub.stats().await.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_oversized_offer_never_reaches_receiver() {
        let (hub, mut a, mut b) = paired().await;

        hub.dispatch(
            "a",
            offer("b", "big", "huge.iso", 60 * 1024 * 1024, TransferMode::Direct),
        )
        .await;

        match drain(&mut a).as_slice() {
            [Message::Error(err)] => {
                assert_eq!(err.code, 2004);
                assert_eq!(err.context.as_deref(), Some("big"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(drain(&mut b).is_empty());
        assert_eq!(hub.stats().await.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_duplicate_offer_absorbed() {
        let (hub, mut a, mut b) = paired().await;
        hub.dispatch("a", offer("b", "s1", "x", 1, TransferMode::Direct)).await;
        drain(&mut a);
        drain(&mut b);

        hub.dispatch("a", offer("b", "s2", "x", 1, TransferMode::Direct)).await;
        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut b).is_empty());
        assert!(hub.transfers().get("s2").await.is_none());
    }

    #[tokio::test]
    async fn test_offer_outside_room_dropped() {
        let (hub, mut a, _b) = paired().await;
        let mut c = hub.connect("c").await;
        hub.dispatch("c", join("r2", "addr-c")).await;
        drain(&mut c);

        hub.dispatch("a", offer("c", "s1", "x", 1, TransferMode::Direct)).await;
        assert!(drain(&mut a).is_empty());
        assert!(drain(&mut c).is_empty());
    }

    #[tokio::test]
    async fn test_signal_forwarded_with_sender_id() {
        let (hub, _a, mut b) = paired().await;
        let mut c = hub.connect("c").await;
        hub.dispatch("c", join("r2", "addr-c")).await;
        drain(&mut c);

        let payload = serde_json::json!({ "type": "offer", "sdp": "v=0" });
        hub.dispatch(
            "a",
            Message::Signal(Signal {
                peer: "b".to_string(),
                payload: payload.clone(),
            }),
        )
        .await;
        match drain(&mut b).as_slice() {
            [Message::Signal(signal)] => {
                assert_eq!(signal.peer, "a");
                assert_eq!(signal.payload, payload);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Different room: dropped
        hub.dispatch(
            "a",
            Message::Signal(Signal {
                peer: "c".to_string(),
                payload,
            }),
        )
        .await;
        assert!(drain(&mut c).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_then_cancel_again() {
        let (hub, mut a, mut b) = paired().await;
        hub.dispatch("a", offer("b", "s1", "x", 1, TransferMode::Direct)).await;
        drain(&mut a);
        drain(&mut b);

        let cancel = Message::FileCancel(FileCancel {
            session_id: "s1".to_string(),
            reason: None,
        });
        hub.dispatch("a", cancel.clone()).await;
        hub.dispatch("a", cancel).await;

        assert_eq!(states(&drain(&mut a)), vec![TransferState::Cancelled]);
        assert_eq!(states(&drain(&mut b)), vec![TransferState::Cancelled]);
    }

    #[tokio::test]
    async fn test_leave_cascades_but_connection_stays_usable() {
        let (hub, mut a, mut b) = paired().await;
        hub.dispatch("a", offer("b", "s1", "x", 1, TransferMode::Direct)).await;
        drain(&mut a);

        hub.dispatch("b", Message::LeaveRoom(LeaveRoom::default())).await;
        let seen_by_a = drain(&mut a);
        assert_eq!(states(&seen_by_a), vec![TransferState::Cancelled]);
        assert!(hub.directory().room_of("b").await.is_none());

        // b can rejoin and receive new offers
        hub.dispatch("b", join("r1", "addr-b")).await;
        drain(&mut b);
        hub.dispatch("a", offer("b", "s2", "x", 1, TransferMode::Direct)).await;
        assert!(
            drain(&mut b)
                .iter()
                .any(|m| matches!(m, Message::TransferOffered(_)))
        );
    }

    #[tokio::test]
    async fn test_chunks_on_direct_session_rejected() {
        let (hub, mut a, _b) = paired().await;
        hub.dispatch("a", offer("b", "s1", "x", 4, TransferMode::Direct)).await;
        hub.dispatch("b", accept("s1")).await;
        drain(&mut a);

        hub.dispatch("a", chunk("s1", 0, vec![1, 2, 3, 4])).await;
        match drain(&mut a).as_slice() {
            [Message::Error(err)] => assert_eq!(err.code, 1003),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chunked_offer_bounded_by_message_ceiling() {
        let (hub, mut a, mut b) = paired().await;
        let bound = relayable_size(MAX_FRAME_SIZE);

        hub.dispatch("a", offer("b", "over", "disk.img", bound + 1, TransferMode::Chunked)).await;
        match drain(&mut a).as_slice() {
            [Message::Error(err)] => {
                assert_eq!(err.code, 2004);
                assert_eq!(err.context.as_deref(), Some("over"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(drain(&mut b).is_empty());

        hub.dispatch("a", offer("b", "fits", "disk.img", bound, TransferMode::Chunked)).await;
        assert_eq!(states(&drain(&mut a)), vec![TransferState::Offered]);
        assert!(
            drain(&mut b)
                .iter()
                .any(|m| matches!(m, Message::TransferOffered(o) if o.file.size == bound))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_chunk_racing_disconnect_leaves_no_chunk_set() {
        let hub = Arc::new(Hub::new(TransferPolicy::default()));

        for i in 0..64 {
            let (a, b) = (format!("a{}", i), format!("b{}", i));
            let room = format!("r{}", i);
            let _rx_a = hub.connect(&a).await;
            let _rx_b = hub.connect(&b).await;
            hub.dispatch(&a, join(&room, "addr-a")).await;
            hub.dispatch(&b, join(&room, "addr-b")).await;
            hub.dispatch(&a, offer(&b, &room, "v.mp4", 100, TransferMode::Chunked)).await;
            hub.dispatch(&b, accept(&room)).await;

            let sending = {
                let hub = Arc::clone(&hub);
                let (a, id) = (a.clone(), room.clone());
                tokio::spawn(async move { hub.dispatch(&a, chunk(&id, 0, vec![0; 10])).await })
            };
            let leaving = {
                let hub = Arc::clone(&hub);
                let a = a.clone();
                tokio::spawn(async move { hub.disconnect(&a).await })
            };
            sending.await.unwrap();
            leaving.await.unwrap();
            hub.disconnect(&b).await;

            assert_eq!(hub.stats().await.reassembling, 0, "iteration {}", i);
        }
        assert_eq!(hub.stats().await.active_sessions, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_counterpart_sees_cancel_after_peer_left_directory() {
        let hub = Arc::new(Hub::new(TransferPolicy::default()));
        let mut a = hub.connect("a").await;
        let _b = hub.connect("b").await;
        hub.dispatch("a", join("r1", "addr-a")).await;
        hub.dispatch("b", join("r1", "addr-b")).await;
        hub.dispatch("a", offer("b", "s1", "doc.pdf", 10, TransferMode::Direct)).await;
        drain(&mut a);

        let leaving = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move { hub.disconnect("b").await })
        };

        // Whenever the cancel becomes visible, b is already gone from the room
        loop {
            let Some(message) = a.recv().await else {
                panic!("outbox closed before the cancel arrived");
            };
            if let Message::TransferStateChanged(change) = message {
                assert_eq!(change.state, TransferState::Cancelled);
                assert_eq!(hub.directory().room_of("b").await, None);
                let members = hub.directory().members_of("r1").await;
                assert!(members.iter().all(|p| p.connection_id != "b"));
                break;
            }
        }
        leaving.await.unwrap();
    }

    #[tokio::test]
    async fn test_stats() {
        let (hub, _a, _b) = accepted_chunked(10).await;
        hub.dispatch("a", chunk("s", 0, vec![0; 5])).await;

        let stats = hub.stats().await;
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.rooms, 1);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.reassembling, 1);
    }
}

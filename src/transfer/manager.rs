//! Transfer session manager
//!
//! Owns every live `TransferSession`. Each session sits behind its own mutex
//! so transitions on one session are linearizable without blocking others.
//!
//! Lock order: session mutex, then the ledger, then the session map, then the
//! archive. Nothing holds the session map while waiting on a session mutex.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{DropError, Result};
use crate::protocol::frame::MAX_FRAME_SIZE;
use crate::protocol::messages::{ConnectionId, FileOffer, SessionId};

use super::session::{TransferMode, TransferSession, TransferState};

/// Room kept in a `TransferReady` frame for everything but the file data
pub const READY_ENVELOPE_RESERVE: usize = 64 * 1024;

/// Longest file name, MIME type or session id an offer may carry
pub const MAX_LABEL_LEN: usize = 1024;

/// Largest file whose base64 `TransferReady` frame still fits under
/// `max_message_size`
pub const fn relayable_size(max_message_size: usize) -> u64 {
    let budget = max_message_size.saturating_sub(READY_ENVELOPE_RESERVE);
    (budget / 4 * 3) as u64
}

/// Limits applied to offers and to the terminal-session archive
#[derive(Debug, Clone)]
pub struct TransferPolicy {
    /// Largest file accepted for direct (relayed) transfers
    pub max_direct_size: u64,
    /// Largest file accepted for chunked transfers (reassembled in memory)
    pub max_chunked_size: u64,
    /// Relay message ceiling; caps both modes since every file reaches the
    /// receiver in one `TransferReady` frame
    pub max_message_size: usize,
    /// Terminal sessions kept for late progress queries
    pub archive_len: usize,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            max_direct_size: 50 * 1024 * 1024,
            max_chunked_size: relayable_size(MAX_FRAME_SIZE),
            max_message_size: MAX_FRAME_SIZE,
            archive_len: 256,
        }
    }
}

impl TransferPolicy {
    pub fn limit_for(&self, mode: TransferMode) -> u64 {
        let configured = match mode {
            TransferMode::Direct => self.max_direct_size,
            TransferMode::Chunked => self.max_chunked_size,
        };
        configured.min(relayable_size(self.max_message_size))
    }

    /// Reject offers the relay could not deliver in one frame
    pub fn check(&self, offer: &FileOffer) -> Result<()> {
        let file = &offer.file;
        let labels = [
            ("file name", file.name.len()),
            ("MIME type", file.mime_type.len()),
            ("session id", offer.session_id.as_ref().map_or(0, String::len)),
        ];
        for (what, len) in labels {
            if len > MAX_LABEL_LEN {
                return Err(DropError::size_limit(format!(
                    "{} is {} bytes, at most {} allowed",
                    what, len, MAX_LABEL_LEN
                )));
            }
        }

        let limit = self.limit_for(offer.mode);
        if file.size > limit {
            return Err(DropError::size_limit(format!(
                "{} is {} bytes, {:?} transfers allow at most {}",
                file.name, file.size, offer.mode, limit
            )));
        }
        Ok(())
    }
}

/// A state change, with a snapshot of the session taken right after it
#[derive(Debug, Clone)]
pub struct Transition {
    pub session: TransferSession,
    pub previous: TransferState,
    pub reason: Option<String>,
}

impl Transition {
    pub fn state(&self) -> TransferState {
        self.session.state
    }
}

/// Result of letting a chunk through
#[derive(Debug, Clone)]
pub struct Admission {
    pub session: TransferSession,
    /// Set when this chunk started the transfer
    pub started: Option<Transition>,
}

type ActiveKey = (ConnectionId, ConnectionId, String);

#[derive(Debug, Default)]
struct Ledger {
    /// Non-terminal session per (sender, receiver, file name)
    active: HashMap<ActiveKey, SessionId>,
    /// Connections that may take part in new sessions
    online: HashSet<ConnectionId>,
}

fn active_key(session: &TransferSession) -> ActiveKey {
    (
        session.sender.clone(),
        session.receiver.clone(),
        session.file.name.clone(),
    )
}

/// Transfer session manager
pub struct TransferManager {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<TransferSession>>>>,
    ledger: Mutex<Ledger>,
    archive: Mutex<VecDeque<TransferSession>>,
    policy: TransferPolicy,
}

impl TransferManager {
    pub fn new(policy: TransferPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ledger: Mutex::new(Ledger::default()),
            archive: Mutex::new(VecDeque::new()),
            policy,
        }
    }

    pub fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    /// Mark a connection as able to send and receive offers
    pub async fn attach(&self, connection_id: &str) {
        self.ledger
            .lock()
            .await
            .online
            .insert(connection_id.to_string());
    }

    /// Register a new session in `offered`.
    ///
    /// The size limit is checked before anything else so an oversized offer
    /// never reaches the receiver.
    pub async fn offer(&self, sender: &str, offer: &FileOffer) -> Result<TransferSession> {
        self.policy.check(offer)?;

        if sender == offer.to {
            return Err(DropError::protocol("cannot offer a file to yourself"));
        }

        let session_id = offer
            .session_id
            .clone()
            .unwrap_or_else(crate::generate_session_id);

        let mut ledger = self.ledger.lock().await;
        if !ledger.online.contains(sender) {
            return Err(DropError::not_found(format!("sender {} is gone", sender)));
        }
        if !ledger.online.contains(&offer.to) {
            return Err(DropError::not_found(format!(
                "receiver {} is not connected",
                offer.to
            )));
        }

        let key = (sender.to_string(), offer.to.clone(), offer.file.name.clone());
        if let Some(existing) = ledger.active.get(&key) {
            return Err(DropError::conflict(format!(
                "{} -> {} already has session {} for {}",
                sender, offer.to, existing, offer.file.name
            )));
        }

        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session_id)
            || self
                .archive
                .lock()
                .await
                .iter()
                .any(|s| s.session_id == session_id)
        {
            return Err(DropError::conflict(format!(
                "session id {} already used",
                session_id
            )));
        }

        let session = TransferSession::new(
            session_id.clone(),
            sender.to_string(),
            offer.to.clone(),
            offer.file.clone(),
            offer.mode,
        );

        ledger.active.insert(key, session_id.clone());
        sessions.insert(session_id.clone(), Arc::new(Mutex::new(session.clone())));

        info!(
            "Session {} offered: {} -> {} ({}, {} bytes, {:?})",
            session_id, sender, offer.to, offer.file.name, offer.file.size, offer.mode
        );
        Ok(session)
    }

    /// Receiver's answer to an offer
    pub async fn respond(
        &self,
        connection_id: &str,
        session_id: &str,
        accept: bool,
    ) -> Result<Transition> {
        let entry = self.entry(session_id).await?;
        let mut session = entry.lock().await;
        Self::ensure_live(&session)?;

        if session.receiver != connection_id {
            return Err(DropError::not_found(format!(
                "{} is not the receiver of {}",
                connection_id, session_id
            )));
        }
        if session.state != TransferState::Offered {
            return Err(DropError::stale_state(format!(
                "session {} already answered ({})",
                session_id, session.state
            )));
        }

        let next = if accept {
            TransferState::Accepted
        } else {
            TransferState::Rejected
        };
        self.apply(&mut session, next, None).await
    }

    /// Relay a direct-mode payload.
    ///
    /// `payload` is the decoded file (or the decode failure). `on_start` sees
    /// the `transferring` transition before `deliver` hands the bytes to the
    /// receiver. Returns the terminal transition.
    pub async fn begin_direct_transfer<S, F>(
        &self,
        connection_id: &str,
        session_id: &str,
        payload: Result<Bytes>,
        on_start: S,
        deliver: F,
    ) -> Result<Transition>
    where
        S: FnOnce(&Transition),
        F: FnOnce(&TransferSession, Bytes) -> Result<()>,
    {
        let entry = self.entry(session_id).await?;
        let mut session = entry.lock().await;
        Self::ensure_live(&session)?;
        Self::ensure_sender(&session, connection_id)?;

        if session.mode != TransferMode::Direct {
            return Err(DropError::protocol(format!(
                "session {} is chunked, payload must go over a data stream",
                session_id
            )));
        }
        if session.state != TransferState::Accepted {
            return Err(DropError::stale_state(format!(
                "session {} is {}, not accepted",
                session_id, session.state
            )));
        }

        let started = self
            .apply(&mut session, TransferState::Transferring, None)
            .await?;
        on_start(&started);

        let outcome = payload.and_then(|data| {
            if data.len() as u64 != session.file.size {
                return Err(DropError::corruption(format!(
                    "payload is {} bytes, offer said {}",
                    data.len(),
                    session.file.size
                )));
            }
            session.bytes_transferred = data.len() as u64;
            deliver(&session, data)
        });

        match outcome {
            Ok(()) => self.apply(&mut session, TransferState::Completed, None).await,
            Err(e) => {
                self.apply(&mut session, TransferState::Failed, Some(e.to_string()))
                    .await
            }
        }
    }

    /// Start a chunked transfer announced by the sender.
    ///
    /// `open` runs under the session lock right before the move to
    /// `transferring`; if it fails the session stays `accepted`. A total size
    /// that disagrees with the offer fails the session at once.
    pub async fn begin_chunked_transfer<O, Fut>(
        &self,
        connection_id: &str,
        session_id: &str,
        total_size: u64,
        chunk_size: u32,
        open: O,
    ) -> Result<Vec<Transition>>
    where
        O: FnOnce(&TransferSession) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let entry = self.entry(session_id).await?;
        let mut session = entry.lock().await;
        Self::ensure_live(&session)?;
        Self::ensure_sender(&session, connection_id)?;
        Self::ensure_chunked(&session)?;

        if chunk_size == 0 {
            return Err(DropError::protocol("chunk size must be positive"));
        }
        if session.state != TransferState::Accepted {
            return Err(DropError::stale_state(format!(
                "session {} is {}, not accepted",
                session_id, session.state
            )));
        }

        if total_size != session.file.size {
            let reason = DropError::corruption(format!(
                "announced {} bytes, offer said {}",
                total_size, session.file.size
            ));
            session.chunk_size = Some(chunk_size);
            let started = self
                .apply(&mut session, TransferState::Transferring, None)
                .await?;
            let failed = self
                .apply(&mut session, TransferState::Failed, Some(reason.to_string()))
                .await?;
            return Ok(vec![started, failed]);
        }

        open(&session).await?;
        session.chunk_size = Some(chunk_size);
        let started = self
            .apply(&mut session, TransferState::Transferring, None)
            .await?;
        Ok(vec![started])
    }

    /// Let a chunk through for a session, beginning the transfer if it is
    /// still `accepted`. `open` runs under the session lock only when this
    /// chunk begins the transfer.
    pub async fn admit_chunk<O, Fut>(
        &self,
        connection_id: &str,
        session_id: &str,
        chunk_len: usize,
        open: O,
    ) -> Result<Admission>
    where
        O: FnOnce(&TransferSession) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let entry = self.entry(session_id).await?;
        let mut session = entry.lock().await;
        Self::ensure_live(&session)?;
        Self::ensure_sender(&session, connection_id)?;
        Self::ensure_chunked(&session)?;

        let started = match session.state {
            TransferState::Transferring => None,
            TransferState::Accepted => {
                open(&session).await?;
                session.chunk_size = u32::try_from(chunk_len).ok().filter(|&n| n > 0);
                debug!("First chunk begins session {}", session_id);
                Some(
                    self.apply(&mut session, TransferState::Transferring, None)
                        .await?,
                )
            }
            state => {
                return Err(DropError::stale_state(format!(
                    "chunk for session {} in state {}",
                    session_id, state
                )));
            }
        };

        Ok(Admission {
            session: session.clone(),
            started,
        })
    }

    /// Record bytes received so far; returns a snapshot only when the
    /// percentage went up
    pub async fn record_progress(&self, session_id: &str, received: u64) -> Option<TransferSession> {
        let entry = self.entry(session_id).await.ok()?;
        let mut session = entry.lock().await;
        if session.state != TransferState::Transferring {
            return None;
        }

        let before = session.progress();
        session.bytes_transferred = session.bytes_transferred.max(received);
        (session.progress() > before).then(|| session.clone())
    }

    /// Finish a transferring session; `deliver` failing turns it into `failed`
    pub async fn complete_with<F>(&self, session_id: &str, deliver: F) -> Result<Transition>
    where
        F: FnOnce(&TransferSession) -> Result<()>,
    {
        let entry = self.entry(session_id).await?;
        let mut session = entry.lock().await;
        Self::ensure_live(&session)?;

        if session.state != TransferState::Transferring {
            return Err(DropError::stale_state(format!(
                "session {} is {}, not transferring",
                session_id, session.state
            )));
        }

        session.bytes_transferred = session.file.size;
        match deliver(&session) {
            Ok(()) => self.apply(&mut session, TransferState::Completed, None).await,
            Err(e) => {
                self.apply(&mut session, TransferState::Failed, Some(e.to_string()))
                    .await
            }
        }
    }

    /// Fail a transferring session
    pub async fn fail(&self, session_id: &str, reason: impl Into<String>) -> Result<Transition> {
        let entry = self.entry(session_id).await?;
        let mut session = entry.lock().await;
        Self::ensure_live(&session)?;
        self.apply(&mut session, TransferState::Failed, Some(reason.into()))
            .await
    }

    /// Abort a session: `offered`/`accepted` become `cancelled`,
    /// `transferring` becomes `failed`.
    ///
    /// With `connection_id` set, only a participant may abort.
    pub async fn abort(
        &self,
        connection_id: Option<&str>,
        session_id: &str,
        reason: impl Into<String>,
    ) -> Result<Transition> {
        let entry = self.entry(session_id).await?;
        let mut session = entry.lock().await;
        Self::ensure_live(&session)?;

        if let Some(conn) = connection_id {
            if !session.involves(conn) {
                return Err(DropError::not_found(format!(
                    "{} is not part of session {}",
                    conn, session_id
                )));
            }
        }

        let next = match session.state {
            TransferState::Offered | TransferState::Accepted => TransferState::Cancelled,
            TransferState::Transferring => TransferState::Failed,
            state => {
                return Err(DropError::stale_state(format!(
                    "session {} already {}",
                    session_id, state
                )));
            }
        };

        self.apply(&mut session, next, Some(reason.into())).await
    }

    /// Abort every non-terminal session the connection takes part in
    pub async fn abort_all_for(&self, connection_id: &str, reason: &str) -> Vec<Transition> {
        let session_ids: Vec<SessionId> = {
            let ledger = self.ledger.lock().await;
            ledger
                .active
                .iter()
                .filter(|((sender, receiver, _), _)| {
                    sender == connection_id || receiver == connection_id
                })
                .map(|(_, id)| id.clone())
                .collect()
        };

        let mut transitions = Vec::with_capacity(session_ids.len());
        for id in session_ids {
            match self.abort(None, &id, reason).await {
                Ok(t) => transitions.push(t),
                Err(e) => debug!("Skipping session {} on cleanup: {}", id, e),
            }
        }
        transitions
    }

    /// Take a departing connection offline and abort its sessions.
    ///
    /// Once offline no new offer can name it, so nothing survives the cleanup.
    pub async fn detach(&self, connection_id: &str) -> Vec<Transition> {
        self.ledger.lock().await.online.remove(connection_id);
        self.abort_all_for(connection_id, "peer disconnected").await
    }

    /// Current progress percentage, terminal sessions included while archived
    pub async fn progress(&self, session_id: &str) -> Result<u8> {
        self.get(session_id)
            .await
            .map(|s| s.progress())
            .ok_or_else(|| DropError::not_found(format!("unknown session {}", session_id)))
    }

    /// Snapshot of a live or archived session
    pub async fn get(&self, session_id: &str) -> Option<TransferSession> {
        let entry = self.sessions.read().await.get(session_id).cloned();
        if let Some(entry) = entry {
            return Some(entry.lock().await.clone());
        }

        self.archive
            .lock()
            .await
            .iter()
            .rev()
            .find(|s| s.session_id == session_id)
            .cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn entry(&self, session_id: &str) -> Result<Arc<Mutex<TransferSession>>> {
        let entry = self.sessions.read().await.get(session_id).cloned();
        if let Some(entry) = entry {
            return Ok(entry);
        }

        let archived = self
            .archive
            .lock()
            .await
            .iter()
            .any(|s| s.session_id == session_id);
        if archived {
            Err(DropError::stale_state(format!(
                "session {} already finished",
                session_id
            )))
        } else {
            Err(DropError::not_found(format!("unknown session {}", session_id)))
        }
    }

    async fn apply(
        &self,
        session: &mut TransferSession,
        next: TransferState,
        reason: Option<String>,
    ) -> Result<Transition> {
        let previous = session.transition(next)?;

        match &reason {
            Some(r) => info!(
                "Session {}: {} -> {} ({})",
                session.session_id, previous, next, r
            ),
            None => debug!("Session {}: {} -> {}", session.session_id, previous, next),
        }

        if next.is_terminal() {
            self.retire(session).await;
        }

        Ok(Transition {
            session: session.clone(),
            previous,
            reason,
        })
    }

    async fn retire(&self, session: &TransferSession) {
        {
            let mut ledger = self.ledger.lock().await;
            let key = active_key(session);
            if ledger.active.get(&key) == Some(&session.session_id) {
                ledger.active.remove(&key);
            }
        }

        self.sessions.write().await.remove(&session.session_id);

        if self.policy.archive_len == 0 {
            return;
        }
        let mut archive = self.archive.lock().await;
        archive.push_back(session.clone());
        while archive.len() > self.policy.archive_len {
            archive.pop_front();
        }
    }

    // A session retired between lookup and lock
    fn ensure_live(session: &TransferSession) -> Result<()> {
        if session.state.is_terminal() {
            return Err(DropError::stale_state(format!(
                "session {} already {}",
                session.session_id, session.state
            )));
        }
        Ok(())
    }

    fn ensure_sender(session: &TransferSession, connection_id: &str) -> Result<()> {
        if session.sender != connection_id {
            return Err(DropError::not_found(format!(
                "{} is not the sender of {}",
                connection_id, session.session_id
            )));
        }
        Ok(())
    }

    fn ensure_chunked(session: &TransferSession) -> Result<()> {
        if session.mode != TransferMode::Chunked {
            return Err(DropError::protocol(format!(
                "session {} is direct, chunks are not accepted",
                session.session_id
            )));
        }
        Ok(())
    }
}

impl Default for TransferManager {
    fn default() -> Self {
        Self::new(TransferPolicy::default())
    }
}

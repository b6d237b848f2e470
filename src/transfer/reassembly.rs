//! Chunk reassembly for chunked transfers
//!
//! Chunks may arrive in any order. Each is stored by offset; the set is
//! finalized once the received byte count reaches the expected size and the
//! stored ranges tile `[0, expected_size)` exactly.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, RwLock};

use crate::error::{DropError, Result};
use crate::protocol::messages::SessionId;

/// Received/expected byte counts after a chunk is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub received: u64,
    pub expected: u64,
}

impl ChunkProgress {
    pub fn is_complete(&self) -> bool {
        self.received == self.expected
    }
}

/// Chunks of one incoming transfer
#[derive(Debug)]
pub struct ChunkSet {
    pub session_id: SessionId,
    pub expected_size: u64,
    pub received_bytes: u64,
    chunks: BTreeMap<u64, Bytes>,
}

impl ChunkSet {
    pub fn new(session_id: SessionId, expected_size: u64) -> Self {
        Self {
            session_id,
            expected_size,
            received_bytes: 0,
            chunks: BTreeMap::new(),
        }
    }

    /// Store a chunk, rejecting anything past the end or overlapping a stored range
    pub fn add_chunk(&mut self, offset: u64, payload: Bytes) -> Result<ChunkProgress> {
        if payload.is_empty() {
            return Ok(self.progress());
        }

        let len = payload.len() as u64;
        let end = offset.checked_add(len).ok_or_else(|| {
            DropError::corruption(format!("chunk at {} overflows the offset range", offset))
        })?;

        if end > self.expected_size {
            return Err(DropError::corruption(format!(
                "chunk [{}, {}) exceeds expected size {}",
                offset, end, self.expected_size
            )));
        }

        if let Some((&prev_offset, prev)) = self.chunks.range(..=offset).next_back() {
            if prev_offset + prev.len() as u64 > offset {
                return Err(DropError::corruption(format!(
                    "chunk at {} overlaps stored chunk at {}",
                    offset, prev_offset
                )));
            }
        }

        if let Some((&next_offset, _)) = self.chunks.range(offset..).next() {
            if next_offset < end {
                return Err(DropError::corruption(format!(
                    "chunk [{}, {}) overlaps stored chunk at {}",
                    offset, end, next_offset
                )));
            }
        }

        self.chunks.insert(offset, payload);
        self.received_bytes += len;
        Ok(self.progress())
    }

    pub fn progress(&self) -> ChunkProgress {
        ChunkProgress {
            received: self.received_bytes,
            expected: self.expected_size,
        }
    }

    /// Concatenate the stored chunks in offset order.
    ///
    /// Returns `Ok(None)` while bytes are still missing. A gap once the count
    /// says complete is corruption.
    pub fn finalize(&self) -> Result<Option<Bytes>> {
        if self.received_bytes != self.expected_size {
            return Ok(None);
        }

        let capacity = usize::try_from(self.expected_size).map_err(|_| {
            DropError::size_limit(format!("{} bytes cannot be held in memory", self.expected_size))
        })?;

        let mut out = BytesMut::with_capacity(capacity);
        let mut cursor = 0u64;
        for (&offset, data) in &self.chunks {
            if offset != cursor {
                return Err(DropError::corruption(format!(
                    "gap or overlap at byte {} (next chunk starts at {})",
                    cursor, offset
                )));
            }
            out.extend_from_slice(data);
            cursor += data.len() as u64;
        }

        if cursor != self.expected_size {
            return Err(DropError::corruption(format!(
                "chunks cover {} of {} bytes",
                cursor, self.expected_size
            )));
        }

        Ok(Some(out.freeze()))
    }
}

/// Chunk sets of every in-flight chunked transfer, one lock per session
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    sets: RwLock<HashMap<SessionId, Arc<Mutex<ChunkSet>>>>,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start collecting chunks for a session
    pub async fn open(&self, session_id: &str, expected_size: u64) -> Result<()> {
        let mut sets = self.sets.write().await;
        if sets.contains_key(session_id) {
            return Err(DropError::conflict(format!(
                "chunk set for {} already open",
                session_id
            )));
        }

        sets.insert(
            session_id.to_string(),
            Arc::new(Mutex::new(ChunkSet::new(session_id.to_string(), expected_size))),
        );
        Ok(())
    }

    async fn set(&self, session_id: &str) -> Result<Arc<Mutex<ChunkSet>>> {
        let sets = self.sets.read().await;
        sets.get(session_id)
            .cloned()
            .ok_or_else(|| DropError::not_found(format!("no chunk set for {}", session_id)))
    }

    pub async fn add_chunk(
        &self,
        session_id: &str,
        offset: u64,
        payload: Bytes,
    ) -> Result<ChunkProgress> {
        let set = self.set(session_id).await?;
        let mut set = set.lock().await;
        set.add_chunk(offset, payload)
    }

    /// Reassemble the file if every byte has arrived; the set is dropped on success
    pub async fn try_finalize(&self, session_id: &str) -> Result<Option<Bytes>> {
        let set = self.set(session_id).await?;
        let data = set.lock().await.finalize()?;

        if data.is_some() {
            self.discard(session_id).await;
        }
        Ok(data)
    }

    /// Drop a session's chunks; returns false if none were held
    pub async fn discard(&self, session_id: &str) -> bool {
        self.sets.write().await.remove(session_id).is_some()
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.sets.read().await.contains_key(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sets.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(len: usize, byte: u8) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[test]
    fn test_out_of_order_chunks_reassemble_by_offset() {
        let mut set = ChunkSet::new("video".to_string(), 32768);

        let p = set.add_chunk(16384, filled(16384, 2)).unwrap();
        assert!(!p.is_complete());
        assert!(set.finalize().unwrap().is_none());

        let p = set.add_chunk(0, filled(16384, 1)).unwrap();
        assert!(p.is_complete());

        let data = set.finalize().unwrap().unwrap();
        assert_eq!(data.len(), 32768);
        assert!(data[..16384].iter().all(|&b| b == 1));
        assert!(data[16384..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_chunk_past_end_is_corruption() {
        let mut set = ChunkSet::new("s".to_string(), 10);
        let err = set.add_chunk(8, filled(3, 0)).unwrap_err();
        assert!(matches!(err, DropError::Corruption(_)));
        assert_eq!(set.received_bytes, 0);
    }

    #[test]
    fn test_overlap_is_corruption() {
        let mut set = ChunkSet::new("s".to_string(), 10);
        set.add_chunk(2, filled(4, 0)).unwrap();

        // Starts inside [2, 6)
        assert!(matches!(
            set.add_chunk(4, filled(2, 0)),
            Err(DropError::Corruption(_))
        ));
        // Runs into [2, 6)
        assert!(matches!(
            set.add_chunk(0, filled(3, 0)),
            Err(DropError::Corruption(_))
        ));
        // Same offset
        assert!(matches!(
            set.add_chunk(2, filled(1, 0)),
            Err(DropError::Corruption(_))
        ));

        // Adjacent ranges are fine
        set.add_chunk(0, filled(2, 0)).unwrap();
        set.add_chunk(6, filled(4, 0)).unwrap();
        assert_eq!(set.finalize().unwrap().unwrap().len(), 10);
    }

    #[test]
    fn test_offset_overflow_rejected() {
        let mut set = ChunkSet::new("s".to_string(), 10);
        assert!(matches!(
            set.add_chunk(u64::MAX, filled(2, 0)),
            Err(DropError::Corruption(_))
        ));
    }

    #[test]
    fn test_empty_expected_finalizes_immediately() {
        let set = ChunkSet::new("s".to_string(), 0);
        assert_eq!(set.finalize().unwrap(), Some(Bytes::new()));
    }

    #[tokio::test]
    async fn test_buffer_lifecycle() {
        let buffer = ReassemblyBuffer::new();
        buffer.open("s-1", 4).await.unwrap();
        assert!(matches!(
            buffer.open("s-1", 4).await,
            Err(DropError::Conflict(_))
        ));

        buffer.add_chunk("s-1", 2, Bytes::from_static(b"cd")).await.unwrap();
        assert!(buffer.try_finalize("s-1").await.unwrap().is_none());

        buffer.add_chunk("s-1", 0, Bytes::from_static(b"ab")).await.unwrap();
        let data = buffer.try_finalize("s-1").await.unwrap().unwrap();
        assert_eq!(&data[..], b"abcd");

        // Finalized sets are gone
        assert!(buffer.is_empty().await);
        assert!(matches!(
            buffer.add_chunk("s-1", 0, Bytes::from_static(b"x")).await,
            Err(DropError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_discard() {
        let buffer = ReassemblyBuffer::new();
        buffer.open("s-1", 100).await.unwrap();
        assert!(buffer.contains("s-1").await);
        assert!(buffer.discard("s-1").await);
        assert!(!buffer.discard("s-1").await);
        assert_eq!(buffer.len().await, 0);
    }
}

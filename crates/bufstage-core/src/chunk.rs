//! Chunk: append-only accumulator for serialized records
//!
//! A chunk belongs to exactly one metadata key and is owned by exactly one
//! lifecycle stage at a time (staged slot, queue, or in-flight set). Its id
//! is generated once at creation and stays stable across retries so
//! destinations can deduplicate redelivered payloads.

use crate::metadata::MetadataKey;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Opaque chunk identifier, stable across retries of the same payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(Uuid);

impl ChunkId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a chunk currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Accumulating appends in the staged slot for its key
    Staged,
    /// Sealed and waiting in the flush queue
    Queued,
    /// Claimed by a delayed-commit write, awaiting acknowledgment
    Dequeued,
    /// Content discarded after a successful write
    Purged,
}

/// Mutable accumulator of serialized records for one metadata key.
#[derive(Debug, Clone)]
pub struct Chunk {
    id: ChunkId,
    metadata: MetadataKey,
    content: Vec<u8>,
    records: usize,
    state: ChunkState,
    created_at: DateTime<Utc>,
    /// Queue position assigned at first seal; retries keep it so rolled-back
    /// chunks sort ahead of newer work.
    enqueue_seq: Option<u64>,
}

impl Chunk {
    pub(crate) fn new(metadata: MetadataKey, created_at: DateTime<Utc>) -> Self {
        Self {
            id: ChunkId::generate(),
            metadata,
            content: Vec::new(),
            records: 0,
            state: ChunkState::Staged,
            created_at,
            enqueue_seq: None,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn metadata(&self) -> &MetadataKey {
        &self.metadata
    }

    /// Readable view of the accumulated bytes.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Number of records appended so far.
    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Hash of the accumulated payload, for destination-side dedup.
    pub fn content_hash(&self) -> blake3::Hash {
        blake3::hash(&self.content)
    }

    pub(crate) fn enqueue_seq(&self) -> Option<u64> {
        self.enqueue_seq
    }

    pub(crate) fn append(&mut self, bytes: &[u8]) -> usize {
        debug_assert_eq!(self.state, ChunkState::Staged, "append to non-staged chunk");
        self.content.extend_from_slice(bytes);
        self.records += 1;
        self.content.len()
    }

    pub(crate) fn mark_queued(&mut self, seq: u64) {
        self.state = ChunkState::Queued;
        // First seal assigns the sequence; retries keep the original.
        if self.enqueue_seq.is_none() {
            self.enqueue_seq = Some(seq);
        }
    }

    pub(crate) fn mark_dequeued(&mut self) {
        self.state = ChunkState::Dequeued;
    }

    pub(crate) fn mark_purged(&mut self) {
        self.content = Vec::new();
        self.state = ChunkState::Purged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn chunk() -> Chunk {
        Chunk::new(MetadataKey::empty(), Utc.timestamp_opt(0, 0).unwrap())
    }

    #[test]
    fn test_append_accumulates_in_order() {
        let mut c = chunk();
        assert!(c.is_empty());
        assert_eq!(c.append(b"hello\n"), 6);
        assert_eq!(c.append(b"world\n"), 12);
        assert_eq!(c.content(), b"hello\nworld\n");
        assert_eq!(c.record_count(), 2);
        assert_eq!(c.size(), 12);
    }

    #[test]
    fn test_seq_is_stable_across_reseal() {
        let mut c = chunk();
        c.append(b"x");
        c.mark_queued(7);
        assert_eq!(c.enqueue_seq(), Some(7));
        c.mark_dequeued();
        c.mark_queued(99);
        // Retry keeps the original queue position
        assert_eq!(c.enqueue_seq(), Some(7));
    }

    #[test]
    fn test_purge_discards_content() {
        let mut c = chunk();
        c.append(b"payload");
        c.mark_purged();
        assert!(c.is_empty());
        assert_eq!(c.state(), ChunkState::Purged);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(chunk().id(), chunk().id());
    }

    #[test]
    fn test_content_hash_tracks_payload() {
        let mut a = chunk();
        let mut b = chunk();
        a.append(b"same");
        b.append(b"same");
        assert_eq!(a.content_hash(), b.content_hash());
        b.append(b"more");
        assert_ne!(a.content_hash(), b.content_hash());
    }
}

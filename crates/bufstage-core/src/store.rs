//! Buffer store
//!
//! The single shared mutable resource of the engine. Holds at most one
//! staged chunk per metadata key, an ordered queue of sealed chunks, and
//! the set of in-flight delayed-commit chunks. All mutation happens under
//! one lock; size counters are atomics so monitoring reads stay lock-free.
//!
//! The queue is kept sorted by each chunk's original enqueue sequence.
//! Rolled-back chunks keep the sequence assigned at their first seal, so a
//! sorted re-insert both prioritizes retries over newer work and preserves
//! FIFO among chunks rolled back simultaneously.

use crate::chunk::{Chunk, ChunkId};
use crate::clock::SharedClock;
use crate::error::BufferError;
use crate::metadata::MetadataKey;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

struct QueuedEntry {
    chunk: Box<Chunk>,
    /// Retry backoff deadline; the chunk is not claimable before this.
    not_before: Option<DateTime<Utc>>,
}

struct DequeuedEntry {
    chunk: Arc<Chunk>,
    taken_at: DateTime<Utc>,
}

struct Inner {
    staged: HashMap<MetadataKey, Box<Chunk>>,
    queue: VecDeque<QueuedEntry>,
    dequeued: HashMap<ChunkId, DequeuedEntry>,
    /// Permanently failed chunks, kept for operator inspection.
    failed: HashMap<ChunkId, Chunk>,
    next_seq: u64,
    closed: bool,
}

/// A chunk claimed by a flush worker.
///
/// Synchronous writes own the chunk until the attempt resolves; delayed
/// writes only borrow a tracked view while the store keeps the chunk in its
/// dequeued set awaiting acknowledgment.
pub enum ClaimedChunk {
    Owned(Box<Chunk>),
    Tracked(Arc<Chunk>),
}

impl ClaimedChunk {
    pub fn chunk(&self) -> &Chunk {
        match self {
            ClaimedChunk::Owned(c) => c,
            ClaimedChunk::Tracked(c) => c,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.chunk().id()
    }
}

/// Point-in-time view of buffer occupancy and delivery counters.
#[derive(Debug, Clone, Copy)]
pub struct BufferMetrics {
    pub staged_chunks: usize,
    pub queued_chunks: usize,
    pub dequeued_chunks: usize,
    pub failed_chunks: usize,
    pub staged_bytes: usize,
    pub queued_bytes: usize,
    pub dequeued_bytes: usize,
    pub inflight_bytes: usize,
    pub emit_count: u64,
    pub write_count: u64,
    pub rollback_count: u64,
    pub flush_error_count: u64,
}

impl BufferMetrics {
    /// True when nothing remains to deliver.
    pub fn is_drained(&self) -> bool {
        self.staged_chunks == 0 && self.queued_chunks == 0 && self.dequeued_chunks == 0
    }
}

/// Authoritative container for all chunk state.
pub struct BufferStore {
    chunk_limit_bytes: usize,
    total_limit_bytes: usize,
    clock: SharedClock,
    inner: Mutex<Inner>,
    work_available: Condvar,

    staged_bytes: AtomicUsize,
    queued_bytes: AtomicUsize,
    dequeued_bytes: AtomicUsize,
    inflight_bytes: AtomicUsize,

    emit_count: AtomicU64,
    write_count: AtomicU64,
    rollback_count: AtomicU64,
    flush_error_count: AtomicU64,
}

impl BufferStore {
    pub fn new(chunk_limit_bytes: usize, total_limit_bytes: usize, clock: SharedClock) -> Self {
        Self {
            chunk_limit_bytes,
            total_limit_bytes,
            clock,
            inner: Mutex::new(Inner {
                staged: HashMap::new(),
                queue: VecDeque::new(),
                dequeued: HashMap::new(),
                failed: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            work_available: Condvar::new(),
            staged_bytes: AtomicUsize::new(0),
            queued_bytes: AtomicUsize::new(0),
            dequeued_bytes: AtomicUsize::new(0),
            inflight_bytes: AtomicUsize::new(0),
            emit_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            rollback_count: AtomicU64::new(0),
            flush_error_count: AtomicU64::new(0),
        }
    }

    pub fn chunk_limit_bytes(&self) -> usize {
        self.chunk_limit_bytes
    }

    /// Total bytes currently held across all lifecycle stages.
    pub fn total_bytes(&self) -> usize {
        self.staged_bytes.load(Ordering::Relaxed)
            + self.queued_bytes.load(Ordering::Relaxed)
            + self.dequeued_bytes.load(Ordering::Relaxed)
            + self.inflight_bytes.load(Ordering::Relaxed)
    }

    /// Append one serialized record to the staged chunk for `key`.
    ///
    /// Creates the chunk if absent. If the record would push the staged
    /// chunk over the byte ceiling, the current chunk is sealed first and a
    /// fresh one takes the record; a single record is never split across
    /// chunks. Returns the staged chunk's size after the append.
    pub fn append(&self, key: &MetadataKey, bytes: &[u8]) -> Result<usize, BufferError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(BufferError::Closed);
        }

        let available = self.total_limit_bytes.saturating_sub(self.total_bytes());
        if bytes.len() > available {
            return Err(BufferError::overflow(bytes.len(), available));
        }

        if let Some(current) = inner.staged.get(key) {
            if !current.is_empty() && current.size() + bytes.len() > self.chunk_limit_bytes {
                let full = inner.staged.remove(key).expect("staged chunk just observed");
                self.staged_bytes.fetch_sub(full.size(), Ordering::Relaxed);
                self.enqueue_locked(&mut inner, full, None);
            }
        }

        if bytes.len() > self.chunk_limit_bytes {
            warn!(
                key = %key,
                record_bytes = bytes.len(),
                chunk_limit_bytes = self.chunk_limit_bytes,
                "single record exceeds the chunk byte ceiling; storing it in its own chunk"
            );
        }

        let now = self.clock.now();
        let chunk = inner
            .staged
            .entry(key.clone())
            .or_insert_with(|| Box::new(Chunk::new(key.clone(), now)));
        let size_after = chunk.append(bytes);
        self.staged_bytes.fetch_add(bytes.len(), Ordering::Relaxed);
        Ok(size_after)
    }

    /// Seal the staged chunk for `key` into the queue.
    ///
    /// Returns true when a non-empty chunk was enqueued.
    pub fn seal(&self, key: &MetadataKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.staged.remove(key) {
            Some(chunk) if !chunk.is_empty() => {
                self.staged_bytes.fetch_sub(chunk.size(), Ordering::Relaxed);
                debug!(key = %key, chunk = %chunk.id(), bytes = chunk.size(), "sealed chunk");
                self.enqueue_locked(&mut inner, chunk, None);
                true
            }
            Some(_) => false,
            None => false,
        }
    }

    /// Seal every staged chunk, in metadata-key order. Returns how many
    /// chunks were enqueued.
    pub fn seal_all(&self) -> usize {
        let mut keys: Vec<MetadataKey> = {
            let inner = self.inner.lock();
            inner.staged.keys().cloned().collect()
        };
        keys.sort();
        keys.iter().filter(|key| self.seal(key)).count()
    }

    /// Claim the next deliverable chunk, if any.
    ///
    /// Scans from the front of the queue, skipping chunks whose retry
    /// backoff deadline has not passed. A chunk is never handed out while
    /// an earlier chunk with the same metadata key was skipped, so per-key
    /// delivery order survives retries. With `delayed` set the chunk moves
    /// to the dequeued set awaiting acknowledgment; otherwise the caller
    /// owns it until the write attempt resolves.
    pub fn try_pop(&self, delayed: bool) -> Option<ClaimedChunk> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let mut skipped: HashSet<MetadataKey> = HashSet::new();
        let mut found = None;
        for (idx, entry) in inner.queue.iter().enumerate() {
            let eligible = entry.not_before.map_or(true, |t| t <= now);
            if eligible && !skipped.contains(entry.chunk.metadata()) {
                found = Some(idx);
                break;
            }
            skipped.insert(entry.chunk.metadata().clone());
        }

        let idx = found?;
        let entry = inner.queue.remove(idx).expect("index from scan");
        let size = entry.chunk.size();
        self.queued_bytes.fetch_sub(size, Ordering::Relaxed);

        if delayed {
            let mut chunk = *entry.chunk;
            chunk.mark_dequeued();
            let arc = Arc::new(chunk);
            inner.dequeued.insert(
                arc.id(),
                DequeuedEntry {
                    chunk: Arc::clone(&arc),
                    taken_at: now,
                },
            );
            self.dequeued_bytes.fetch_add(size, Ordering::Relaxed);
            Some(ClaimedChunk::Tracked(arc))
        } else {
            self.inflight_bytes.fetch_add(size, Ordering::Relaxed);
            Some(ClaimedChunk::Owned(entry.chunk))
        }
    }

    /// Park the caller until queued work may be available, the store is
    /// closed, or the timeout elapses. Spurious wakeups are fine; callers
    /// loop around `try_pop`.
    pub fn wait_for_work(&self, timeout: Duration) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        let has_eligible = inner
            .queue
            .iter()
            .any(|e| e.not_before.map_or(true, |t| t <= now));
        if !has_eligible {
            self.work_available.wait_for(&mut inner, timeout);
        }
    }

    /// Record a successful synchronous write of an owned chunk.
    pub fn complete_inflight(&self, mut chunk: Box<Chunk>) {
        self.inflight_bytes.fetch_sub(chunk.size(), Ordering::Relaxed);
        self.write_count.fetch_add(1, Ordering::Relaxed);
        debug!(chunk = %chunk.id(), bytes = chunk.size(), "chunk written and purged");
        chunk.mark_purged();
    }

    /// Return a failed owned chunk to the queue for a later retry.
    pub fn requeue_inflight(&self, chunk: Box<Chunk>, not_before: Option<DateTime<Utc>>) {
        self.flush_error_count.fetch_add(1, Ordering::Relaxed);
        self.inflight_bytes.fetch_sub(chunk.size(), Ordering::Relaxed);
        let mut inner = self.inner.lock();
        self.enqueue_locked(&mut inner, chunk, not_before);
    }

    /// Shelve an owned chunk whose retries are exhausted.
    pub fn fail_inflight(&self, chunk: Box<Chunk>) {
        self.inflight_bytes.fetch_sub(chunk.size(), Ordering::Relaxed);
        let mut inner = self.inner.lock();
        inner.failed.insert(chunk.id(), *chunk);
    }

    /// Remove a chunk from the dequeued set and discard it. Idempotent:
    /// purging an unknown or already-purged id is a no-op.
    pub fn purge(&self, id: ChunkId) -> bool {
        let mut inner = self.inner.lock();
        match inner.dequeued.remove(&id) {
            Some(entry) => {
                self.dequeued_bytes
                    .fetch_sub(entry.chunk.size(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Acknowledge a delayed write: purge the chunk and count the write.
    /// Returns false (and counts nothing) when the id is not in flight.
    pub fn commit_dequeued(&self, id: ChunkId) -> bool {
        if self.purge(id) {
            self.write_count.fetch_add(1, Ordering::Relaxed);
            debug!(chunk = %id, "delayed write committed");
            true
        } else {
            false
        }
    }

    /// Return a dequeued chunk to the queue after a rollback or timeout.
    pub fn rollback_dequeued(&self, id: ChunkId, not_before: Option<DateTime<Utc>>) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.dequeued.remove(&id) else {
            return false;
        };
        let size = entry.chunk.size();
        self.dequeued_bytes.fetch_sub(size, Ordering::Relaxed);
        self.rollback_count.fetch_add(1, Ordering::Relaxed);
        // The store's reference is normally the last one by the time a
        // rollback happens; clone only if the destination still holds a view.
        let chunk = Arc::try_unwrap(entry.chunk).unwrap_or_else(|arc| (*arc).clone());
        self.enqueue_locked(&mut inner, Box::new(chunk), not_before);
        true
    }

    /// Shelve a dequeued chunk whose retries are exhausted.
    pub fn fail_dequeued(&self, id: ChunkId) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.dequeued.remove(&id) else {
            return false;
        };
        self.dequeued_bytes
            .fetch_sub(entry.chunk.size(), Ordering::Relaxed);
        let chunk = Arc::try_unwrap(entry.chunk).unwrap_or_else(|arc| (*arc).clone());
        inner.failed.insert(id, chunk);
        true
    }

    /// Ids of delayed writes whose acknowledgment deadline has passed.
    /// A timeout too large to represent never expires anything.
    pub fn expired_dequeued(&self, timeout: Duration) -> Vec<ChunkId> {
        let now = self.clock.now();
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return Vec::new();
        };
        let inner = self.inner.lock();
        inner
            .dequeued
            .iter()
            .filter(|(_, entry)| {
                entry
                    .taken_at
                    .checked_add_signed(timeout)
                    .map_or(false, |deadline| deadline <= now)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// All ids currently awaiting delayed acknowledgment.
    pub fn dequeued_ids(&self) -> Vec<ChunkId> {
        self.inner.lock().dequeued.keys().copied().collect()
    }

    /// Snapshot of staged chunks for flush-trigger evaluation.
    pub fn staged_snapshot(&self) -> Vec<StagedChunk> {
        let inner = self.inner.lock();
        inner
            .staged
            .values()
            .map(|chunk| StagedChunk {
                key: chunk.metadata().clone(),
                created_at: chunk.created_at(),
                size: chunk.size(),
            })
            .collect()
    }

    /// Ids of permanently failed chunks retained for inspection.
    pub fn failed_ids(&self) -> Vec<ChunkId> {
        self.inner.lock().failed.keys().copied().collect()
    }

    /// Take a permanently failed chunk off the shelf.
    pub fn take_failed(&self, id: ChunkId) -> Option<Chunk> {
        self.inner.lock().failed.remove(&id)
    }

    /// Move every remaining staged and queued chunk to the failed shelf.
    /// Used at close time so nothing is silently dropped.
    pub fn fail_remaining(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut moved = 0;
        let keys: Vec<MetadataKey> = inner.staged.keys().cloned().collect();
        for key in keys {
            if let Some(chunk) = inner.staged.remove(&key) {
                self.staged_bytes.fetch_sub(chunk.size(), Ordering::Relaxed);
                inner.failed.insert(chunk.id(), *chunk);
                moved += 1;
            }
        }
        while let Some(entry) = inner.queue.pop_front() {
            self.queued_bytes
                .fetch_sub(entry.chunk.size(), Ordering::Relaxed);
            inner.failed.insert(entry.chunk.id(), *entry.chunk);
            moved += 1;
        }
        moved
    }

    /// Drop the retry backoff deadline on every queued chunk so a final
    /// drain can attempt all of them immediately.
    pub fn clear_backoffs(&self) {
        let mut inner = self.inner.lock();
        for entry in inner.queue.iter_mut() {
            entry.not_before = None;
        }
    }

    /// Stop accepting appends and wake all parked workers.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.work_available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Wake parked workers for an immediate queue check.
    pub fn wake_workers(&self) {
        self.work_available.notify_all();
    }

    /// Count one emit call (one per event stream, not per record).
    pub fn note_emit(&self) {
        self.emit_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollback_count.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> BufferMetrics {
        let (staged_chunks, queued_chunks, dequeued_chunks, failed_chunks) = {
            let inner = self.inner.lock();
            (
                inner.staged.len(),
                inner.queue.len(),
                inner.dequeued.len(),
                inner.failed.len(),
            )
        };
        BufferMetrics {
            staged_chunks,
            queued_chunks,
            dequeued_chunks,
            failed_chunks,
            staged_bytes: self.staged_bytes.load(Ordering::Relaxed),
            queued_bytes: self.queued_bytes.load(Ordering::Relaxed),
            dequeued_bytes: self.dequeued_bytes.load(Ordering::Relaxed),
            inflight_bytes: self.inflight_bytes.load(Ordering::Relaxed),
            emit_count: self.emit_count.load(Ordering::Relaxed),
            write_count: self.write_count.load(Ordering::Relaxed),
            rollback_count: self.rollback_count.load(Ordering::Relaxed),
            flush_error_count: self.flush_error_count.load(Ordering::Relaxed),
        }
    }

    /// Insert a chunk into the queue at its sequence-ordered position and
    /// signal a parked worker.
    fn enqueue_locked(
        &self,
        inner: &mut Inner,
        mut chunk: Box<Chunk>,
        not_before: Option<DateTime<Utc>>,
    ) {
        let seq = match chunk.enqueue_seq() {
            Some(seq) => seq,
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                seq
            }
        };
        chunk.mark_queued(seq);
        self.queued_bytes.fetch_add(chunk.size(), Ordering::Relaxed);

        let pos = inner
            .queue
            .iter()
            .position(|e| e.chunk.enqueue_seq() > chunk.enqueue_seq())
            .unwrap_or(inner.queue.len());
        inner.queue.insert(pos, QueuedEntry { chunk, not_before });
        self.work_available.notify_one();
    }
}

/// Staged-chunk view handed to the flush trigger evaluator.
#[derive(Debug, Clone)]
pub struct StagedChunk {
    pub key: MetadataKey,
    pub created_at: DateTime<Utc>,
    pub size: usize,
}

//! Destination contract
//!
//! The destination declares its write protocol once at configuration time;
//! the engine resolves it to a closed set of dispatch paths rather than
//! probing per call. Repeated delivery of the same chunk id must be treated
//! as at-least-once by the destination.

use bufstage_core::{Chunk, ChunkId, Record};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// How the destination acknowledges writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteProtocol {
    /// `write` returns success or failure inline
    Synchronous,
    /// `try_write` hands over the chunk; acknowledgment arrives later
    /// through the commit gate
    Delayed,
}

/// Acknowledgment token for one delayed write attempt.
///
/// Passed to `try_write`; the destination hands it back to
/// [`crate::CommitGate::commit`] or [`crate::CommitGate::rollback`], possibly
/// from a different thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitToken {
    id: ChunkId,
}

impl CommitToken {
    pub(crate) fn new(id: ChunkId) -> Self {
        Self { id }
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.id
    }
}

impl std::fmt::Display for CommitToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Errors surfaced by destination hooks
#[derive(Debug, Error)]
pub enum WriteError {
    /// The write attempt failed; the chunk will be retried
    #[error("write failed: {0}")]
    Write(String),

    /// One record could not be serialized; it is skipped, the chunk stays
    /// intact
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The destination does not implement this hook
    #[error("destination does not support {0}")]
    Unsupported(&'static str),

    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WriteError {
    /// Create a write error
    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

/// Everything the engine needs from the other side of the buffer.
pub trait Destination: Send + Sync {
    /// Turn one record into the bytes appended to its chunk. Called once
    /// per record, before grouping; a failure skips that record only.
    fn serialize(
        &self,
        tag: &str,
        time: DateTime<Utc>,
        record: &Record,
    ) -> Result<Vec<u8>, WriteError>;

    /// Declared once; the engine never re-probes per call.
    fn protocol(&self) -> WriteProtocol {
        WriteProtocol::Synchronous
    }

    /// Synchronous write of a whole chunk.
    fn write(&self, _chunk: &Chunk) -> Result<(), WriteError> {
        Err(WriteError::Unsupported("write"))
    }

    /// Begin a delayed write. The chunk stays buffered until the token is
    /// committed or rolled back.
    fn try_write(&self, _chunk: &Chunk, _token: CommitToken) -> Result<(), WriteError> {
        Err(WriteError::Unsupported("try_write"))
    }

    /// Called during shutdown before unacknowledged chunks are force-rolled
    /// back, giving the destination a last chance to commit.
    fn rollback_all(&self) {}
}

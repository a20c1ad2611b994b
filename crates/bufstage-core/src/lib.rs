//! bufstage-core - chunk buffering primitives
//!
//! The authoritative state for the buffering engine lives here: metadata
//! keys that group incoming events, chunks that accumulate serialized
//! records, and the buffer store that moves chunks through the
//! staged -> queued -> dequeued -> purged lifecycle.

pub mod chunk;
pub mod clock;
pub mod error;
pub mod metadata;
pub mod store;

pub use chunk::{Chunk, ChunkId, ChunkState};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::BufferError;
pub use metadata::{timekey_for, GroupKeys, MetadataKey};
pub use store::{BufferMetrics, BufferStore, ClaimedChunk, StagedChunk};

/// A single event record: field name to JSON value.
pub type Record = serde_json::Map<String, serde_json::Value>;

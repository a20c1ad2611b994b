//! bufstage-engine - flush scheduling and delivery
//!
//! Drives chunks from the buffer store to a destination: a periodic trigger
//! evaluator seals staged chunks, a fixed pool of worker threads delivers
//! sealed chunks through either the synchronous or the delayed-commit write
//! protocol, and a retry controller brings failed chunks back with capped
//! exponential backoff. The lifecycle controller drains everything on
//! shutdown so no chunk is silently lost.
//!
//! ```text
//! emit --> [staged chunks] --tick/seal--> [queue] --workers--> Destination
//!                                           ^                     |
//!                                           +----retry/rollback---+
//! ```

pub mod destination;
pub mod engine;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use destination::{CommitToken, Destination, WriteError, WriteProtocol};
pub use engine::Engine;
pub use error::EngineError;
pub use gate::CommitGate;
pub use lifecycle::LifecycleState;
pub use retry::RetryPolicy;
pub use scheduler::SchedulerControl;

// The engine's public surface speaks in core and config types.
pub use bufstage_config::{EngineConfig, FlushMode};
pub use bufstage_core::{
    BufferError, BufferMetrics, Chunk, ChunkId, Clock, GroupKeys, ManualClock, MetadataKey,
    Record, SharedClock, SystemClock,
};

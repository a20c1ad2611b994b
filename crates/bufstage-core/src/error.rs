//! Error types for buffer operations

use thiserror::Error;

/// Errors raised by the buffer store
#[derive(Debug, Error)]
pub enum BufferError {
    /// Total byte ceiling would be exceeded; the emit is rejected wholesale
    #[error("buffer full: {requested} bytes requested but only {available} available under the total limit")]
    Overflow { requested: usize, available: usize },

    /// Store no longer accepts appends (closed during shutdown)
    #[error("buffer store is closed")]
    Closed,
}

impl BufferError {
    /// Create an overflow error
    pub fn overflow(requested: usize, available: usize) -> Self {
        Self::Overflow {
            requested,
            available,
        }
    }
}

//! Commit gate for delayed writes
//!
//! Cloneable handle the destination (or any other thread) uses to
//! acknowledge delayed write attempts. All bookkeeping merges into the
//! buffer store under its own lock, so acknowledgments may arrive from
//! contexts entirely unrelated to the worker that issued the attempt.

use crate::destination::CommitToken;
use crate::retry::RetryController;
use bufstage_core::BufferStore;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct CommitGate {
    store: Arc<BufferStore>,
    retry: Arc<RetryController>,
}

impl CommitGate {
    pub(crate) fn new(store: Arc<BufferStore>, retry: Arc<RetryController>) -> Self {
        Self { store, retry }
    }

    /// Acknowledge a delayed write: the chunk is purged and the write
    /// counted. Idempotent; committing an already-settled token returns
    /// false without counting anything.
    pub fn commit(&self, token: CommitToken) -> bool {
        let id = token.chunk_id();
        if self.store.commit_dequeued(id) {
            self.retry.forget(id);
            true
        } else {
            debug!(chunk = %id, "commit for a token that is no longer in flight; ignoring");
            false
        }
    }

    /// Reject a delayed write: the chunk returns to the front region of the
    /// queue for another attempt. Idempotent like `commit`.
    pub fn rollback(&self, token: CommitToken) -> bool {
        let id = token.chunk_id();
        if self.store.rollback_dequeued(id, None) {
            warn!(chunk = %id, "delayed write rolled back by destination; chunk requeued");
            true
        } else {
            debug!(chunk = %id, "rollback for a token that is no longer in flight; ignoring");
            false
        }
    }
}

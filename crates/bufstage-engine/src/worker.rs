//! Flush workers
//!
//! Each worker loops claiming sealed chunks and handing them to the
//! destination. Synchronous writes resolve the attempt inline; delayed
//! writes only start it, leaving settlement to the commit gate or the
//! scheduler's timeout sweep. Workers park on the store's condvar between
//! claims instead of busy-polling.

use crate::destination::{CommitToken, Destination, WriteProtocol};
use crate::retry::{RetryController, RetryVerdict};
use bufstage_core::{BufferStore, ClaimedChunk, SharedClock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const IDLE_WAIT: Duration = Duration::from_millis(50);

pub(crate) struct WorkerContext {
    pub(crate) store: Arc<BufferStore>,
    pub(crate) destination: Arc<dyn Destination>,
    pub(crate) retry: Arc<RetryController>,
    pub(crate) clock: SharedClock,
    pub(crate) protocol: WriteProtocol,
    pub(crate) stop: Arc<AtomicBool>,
}

/// Worker thread body.
pub(crate) fn run_worker(ctx: WorkerContext, index: usize) {
    debug!(worker = index, "flush worker started");
    loop {
        if ctx.stop.load(Ordering::Acquire) {
            break;
        }
        if !flush_once(&ctx) {
            ctx.store.wait_for_work(IDLE_WAIT);
        }
    }
    debug!(worker = index, "flush worker stopped");
}

/// Claim and deliver one chunk. Returns false when no chunk was claimable.
pub(crate) fn flush_once(ctx: &WorkerContext) -> bool {
    let delayed = ctx.protocol == WriteProtocol::Delayed;
    let Some(claimed) = ctx.store.try_pop(delayed) else {
        return false;
    };

    match claimed {
        ClaimedChunk::Owned(chunk) => {
            let id = chunk.id();
            match ctx.destination.write(&chunk) {
                Ok(()) => {
                    ctx.retry.forget(id);
                    ctx.store.complete_inflight(chunk);
                }
                Err(err) => match ctx.retry.record_failure(id, ctx.clock.now()) {
                    RetryVerdict::RetryAt(not_before) => {
                        warn!(chunk = %id, error = %err, retry_at = %not_before, "write failed; chunk requeued");
                        ctx.store.requeue_inflight(chunk, Some(not_before));
                    }
                    RetryVerdict::GiveUp {
                        failures,
                        first_failure,
                    } => {
                        error!(
                            chunk = %id,
                            error = %err,
                            failures,
                            failing_since = %first_failure,
                            "write failed and retries are exhausted; chunk moved to failed shelf"
                        );
                        ctx.store.fail_inflight(chunk);
                    }
                },
            }
        }
        ClaimedChunk::Tracked(chunk) => {
            let id = chunk.id();
            let token = CommitToken::new(id);
            if let Err(err) = ctx.destination.try_write(&chunk, token) {
                // Drop our view first so the store's rollback can reclaim
                // the chunk without cloning.
                drop(chunk);
                match ctx.retry.record_failure(id, ctx.clock.now()) {
                    RetryVerdict::RetryAt(not_before) => {
                        warn!(chunk = %id, error = %err, retry_at = %not_before, "delayed write failed to start; chunk requeued");
                        ctx.store.rollback_dequeued(id, Some(not_before));
                    }
                    RetryVerdict::GiveUp {
                        failures,
                        first_failure,
                    } => {
                        error!(
                            chunk = %id,
                            error = %err,
                            failures,
                            failing_since = %first_failure,
                            "delayed write failed and retries are exhausted; chunk moved to failed shelf"
                        );
                        ctx.store.fail_dequeued(id);
                    }
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::WriteError;
    use crate::retry::RetryPolicy;
    use bufstage_core::{Chunk, ManualClock, MetadataKey, Record};
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedDestination {
        protocol: WriteProtocol,
        /// Attempts that should fail before writes start succeeding.
        failures_remaining: AtomicUsize,
        written: Mutex<Vec<Vec<u8>>>,
        tokens: Mutex<Vec<CommitToken>>,
    }

    impl ScriptedDestination {
        fn new(protocol: WriteProtocol, failures: usize) -> Self {
            Self {
                protocol,
                failures_remaining: AtomicUsize::new(failures),
                written: Mutex::new(Vec::new()),
                tokens: Mutex::new(Vec::new()),
            }
        }

        fn take_failure(&self) -> bool {
            self.failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    impl Destination for ScriptedDestination {
        fn serialize(
            &self,
            _tag: &str,
            _time: DateTime<Utc>,
            record: &Record,
        ) -> Result<Vec<u8>, WriteError> {
            serde_json::to_vec(record).map_err(|e| WriteError::serialization(e.to_string()))
        }

        fn protocol(&self) -> WriteProtocol {
            self.protocol
        }

        fn write(&self, chunk: &Chunk) -> Result<(), WriteError> {
            if self.take_failure() {
                return Err(WriteError::write("scripted failure"));
            }
            self.written.lock().push(chunk.content().to_vec());
            Ok(())
        }

        fn try_write(&self, chunk: &Chunk, token: CommitToken) -> Result<(), WriteError> {
            if self.take_failure() {
                return Err(WriteError::write("scripted failure"));
            }
            self.written.lock().push(chunk.content().to_vec());
            self.tokens.lock().push(token);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<BufferStore>,
        clock: Arc<ManualClock>,
        destination: Arc<ScriptedDestination>,
        ctx: WorkerContext,
    }

    fn fixture(protocol: WriteProtocol, failures: usize, max_attempts: Option<u32>) -> Fixture {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let store = Arc::new(BufferStore::new(1024, 1024 * 1024, clock.clone()));
        let destination = Arc::new(ScriptedDestination::new(protocol, failures));
        let retry = Arc::new(RetryController::new(RetryPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            max_attempts,
            Duration::from_secs(3600),
        )));
        let ctx = WorkerContext {
            store: store.clone(),
            destination: destination.clone(),
            retry,
            clock: clock.clone(),
            protocol,
            stop: Arc::new(AtomicBool::new(false)),
        };
        Fixture {
            store,
            clock,
            destination,
            ctx,
        }
    }

    fn queue_chunk(fx: &Fixture, payload: &[u8]) {
        fx.store.append(&MetadataKey::empty(), payload).unwrap();
        fx.store.seal(&MetadataKey::empty());
    }

    #[test]
    fn test_sync_write_success_purges_and_counts() {
        let fx = fixture(WriteProtocol::Synchronous, 0, None);
        queue_chunk(&fx, b"hello");

        assert!(flush_once(&fx.ctx));
        assert!(!flush_once(&fx.ctx));

        assert_eq!(fx.destination.written.lock().as_slice(), &[b"hello".to_vec()]);
        assert_eq!(fx.store.write_count(), 1);
        assert!(fx.store.metrics().is_drained());
    }

    #[test]
    fn test_sync_failure_backs_off_then_succeeds() {
        let fx = fixture(WriteProtocol::Synchronous, 1, None);
        queue_chunk(&fx, b"flaky");

        assert!(flush_once(&fx.ctx));
        let m = fx.store.metrics();
        assert_eq!(m.flush_error_count, 1);
        assert_eq!(m.queued_chunks, 1);

        // Still inside the backoff window
        assert!(!flush_once(&fx.ctx));

        fx.clock.advance_secs(1);
        assert!(flush_once(&fx.ctx));
        assert_eq!(fx.store.write_count(), 1);
        assert!(fx.store.metrics().is_drained());
    }

    #[test]
    fn test_sync_exhaustion_moves_chunk_to_failed_shelf() {
        let fx = fixture(WriteProtocol::Synchronous, usize::MAX, Some(1));
        queue_chunk(&fx, b"doomed");

        assert!(flush_once(&fx.ctx));
        fx.clock.advance_secs(1);
        assert!(flush_once(&fx.ctx));

        let m = fx.store.metrics();
        assert_eq!(m.failed_chunks, 1);
        assert_eq!(m.queued_chunks, 0);
        assert_eq!(fx.store.write_count(), 0);

        let id = fx.store.failed_ids()[0];
        assert_eq!(fx.store.take_failed(id).unwrap().content(), b"doomed");
    }

    #[test]
    fn test_delayed_write_waits_for_commit() {
        let fx = fixture(WriteProtocol::Delayed, 0, None);
        queue_chunk(&fx, b"pending");

        assert!(flush_once(&fx.ctx));
        let m = fx.store.metrics();
        assert_eq!(m.dequeued_chunks, 1);
        assert_eq!(fx.store.write_count(), 0);

        let token = fx.destination.tokens.lock()[0];
        assert!(fx.store.commit_dequeued(token.chunk_id()));
        assert_eq!(fx.store.write_count(), 1);
        assert!(fx.store.metrics().is_drained());
    }

    #[test]
    fn test_delayed_start_failure_rolls_back_with_backoff() {
        let fx = fixture(WriteProtocol::Delayed, 1, None);
        queue_chunk(&fx, b"retry me");

        assert!(flush_once(&fx.ctx));
        let m = fx.store.metrics();
        assert_eq!(m.dequeued_chunks, 0);
        assert_eq!(m.queued_chunks, 1);
        assert_eq!(fx.store.rollback_count(), 1);

        fx.clock.advance_secs(1);
        assert!(flush_once(&fx.ctx));
        assert_eq!(fx.store.metrics().dequeued_chunks, 1);
        assert_eq!(fx.destination.tokens.lock().len(), 1);
    }

    #[test]
    fn test_stop_flag_ends_worker_loop() {
        let fx = fixture(WriteProtocol::Synchronous, 0, None);
        fx.ctx.stop.store(true, Ordering::Release);
        // Returns immediately without claiming anything
        run_worker(fx.ctx, 0);
    }
}

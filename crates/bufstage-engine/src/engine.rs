//! Engine orchestrator
//!
//! Owns the buffer store, the worker pool, the scheduler thread and the
//! retry controller as plain fields, wired together at start and torn down
//! through the sequential lifecycle. Teardown methods auto-run any earlier
//! stage that has not happened yet, so `terminate` alone shuts a running
//! engine down completely.

use crate::destination::{Destination, WriteProtocol};
use crate::error::EngineError;
use crate::gate::CommitGate;
use crate::lifecycle::LifecycleState;
use crate::retry::{RetryController, RetryPolicy};
use crate::scheduler::{run_scheduler, FlushScheduler, SchedulerControl, SchedulerShared};
use crate::worker::{run_worker, WorkerContext};
use bufstage_config::{EngineConfig, FlushMode};
use bufstage_core::{
    BufferMetrics, BufferStore, Chunk, ChunkId, GroupKeys, Record, SharedClock, SystemClock,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Buffering and delivery engine.
///
/// Created in `Configured` state; `start` brings up the worker pool and the
/// flush scheduler, `terminate` (or the intermediate lifecycle methods)
/// drains and tears everything down. Emitters, workers and acknowledgment
/// callers may all run on different threads.
pub struct Engine {
    config: EngineConfig,
    mode: FlushMode,
    group_keys: GroupKeys,
    timekey_range_secs: Option<i64>,
    protocol: WriteProtocol,

    store: Arc<BufferStore>,
    destination: Arc<dyn Destination>,
    retry: Arc<RetryController>,
    clock: SharedClock,

    state: Mutex<LifecycleState>,
    accepting: AtomicBool,
    worker_stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    scheduler_shared: Arc<SchedulerShared>,
    scheduler_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Validate the configuration and wire the engine against the wall
    /// clock.
    pub fn new(
        config: EngineConfig,
        destination: Arc<dyn Destination>,
    ) -> Result<Self, EngineError> {
        Self::with_clock(config, destination, Arc::new(SystemClock))
    }

    /// Like `new` with an explicit clock, so tests can freeze time.
    pub fn with_clock(
        config: EngineConfig,
        destination: Arc<dyn Destination>,
        clock: SharedClock,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let mode = config.resolved_flush_mode();
        let group_keys = GroupKeys::parse(&config.buffer.chunk_keys);
        let timekey_range_secs = config.buffer.timekey_range_secs.map(|v| v as i64);
        let protocol = destination.protocol();

        let store = Arc::new(BufferStore::new(
            config.buffer.chunk_limit_bytes,
            config.buffer.total_limit_bytes,
            Arc::clone(&clock),
        ));
        let retry = Arc::new(RetryController::new(RetryPolicy::from_config(
            &config.delivery,
        )));

        info!(
            mode = %mode,
            protocol = ?protocol,
            chunk_keys = ?config.buffer.chunk_keys,
            workers = config.flush.thread_count,
            "engine configured"
        );

        Ok(Self {
            config,
            mode,
            group_keys,
            timekey_range_secs,
            protocol,
            store,
            destination,
            retry,
            clock,
            state: Mutex::new(LifecycleState::Configured),
            accepting: AtomicBool::new(false),
            worker_stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            scheduler_shared: Arc::new(SchedulerShared::new()),
            scheduler_thread: Mutex::new(None),
        })
    }

    /// Spawn the worker pool and, when any timed trigger or the delayed
    /// timeout sweep is needed, the scheduler thread. Idempotent once
    /// started; restarting a stopped engine is an error.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::Configured => {}
            LifecycleState::Started => return Ok(()),
            other => {
                return Err(EngineError::InvalidTransition {
                    from: other,
                    to: LifecycleState::Started,
                })
            }
        }

        let mut workers = self.workers.lock();
        for index in 0..self.config.flush.thread_count {
            let ctx = self.worker_context();
            let handle = std::thread::Builder::new()
                .name(format!("bufstage-worker-{}", index))
                .spawn(move || run_worker(ctx, index))
                .map_err(|source| EngineError::Spawn {
                    role: "flush worker",
                    source,
                })?;
            workers.push(handle);
        }

        if self.needs_scheduler() {
            let scheduler = FlushScheduler {
                store: Arc::clone(&self.store),
                retry: Arc::clone(&self.retry),
                clock: Arc::clone(&self.clock),
                mode: self.mode,
                flush_interval: self.config.flush.interval(),
                timekey_range_secs: self.timekey_range_secs,
                timekey_wait: self.config.buffer.timekey_wait(),
                delayed_commit_timeout: self.config.delivery.delayed_commit_timeout(),
                tick_interval: self.config.flush.tick_interval(),
                burst_interval: self.config.flush.burst_interval(),
            };
            let shared = Arc::clone(&self.scheduler_shared);
            let handle = std::thread::Builder::new()
                .name("bufstage-scheduler".to_string())
                .spawn(move || run_scheduler(scheduler, shared))
                .map_err(|source| EngineError::Spawn {
                    role: "flush scheduler",
                    source,
                })?;
            *self.scheduler_thread.lock() = Some(handle);
        }

        *state = LifecycleState::Started;
        self.accepting.store(true, Ordering::Release);
        info!("engine started");
        Ok(())
    }

    /// Buffer one stream of events under `tag`.
    ///
    /// Each record serializes through the destination and lands in the
    /// staged chunk for its computed key; a record that fails to serialize
    /// is skipped with a warning, the rest of the stream still goes in.
    /// A full buffer rejects the record with a typed overflow error the
    /// caller can turn into backpressure.
    pub fn emit(
        &self,
        tag: &str,
        events: &[(DateTime<Utc>, Record)],
    ) -> Result<(), EngineError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(EngineError::NotAccepting(*self.state.lock()));
        }

        let mut touched: Vec<bufstage_core::MetadataKey> = Vec::new();
        for (time, record) in events {
            let bytes = match self.destination.serialize(tag, *time, record) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(tag, error = %err, "record serialization failed; record skipped");
                    continue;
                }
            };
            let key = self
                .group_keys
                .key_for(tag, *time, record, self.timekey_range_secs);
            self.store.append(&key, &bytes)?;
            if self.mode == FlushMode::Immediate && !touched.contains(&key) {
                touched.push(key);
            }
        }
        self.store.note_emit();

        // Immediate mode seals every touched key in emit order and hands
        // the work to the pool right away.
        for key in &touched {
            self.store.seal(key);
        }
        if !touched.is_empty() {
            self.store.wake_workers();
        }
        Ok(())
    }

    /// Stop accepting new emits. Buffered chunks keep flushing.
    pub fn stop(&self) {
        self.advance_to(LifecycleState::Stopping);
    }

    /// Seal everything staged and run one final synchronous flush pass.
    pub fn shutdown(&self) {
        self.advance_to(LifecycleState::ShuttingDown);
    }

    /// Give the destination a last chance to commit, then force-roll-back
    /// every still-unacknowledged delayed write.
    pub fn after_shutdown(&self) {
        self.advance_to(LifecycleState::AfterShutdown);
    }

    /// Close the store; whatever still could not be delivered moves to the
    /// failed shelf rather than being silently dropped.
    pub fn close(&self) {
        self.advance_to(LifecycleState::Closed);
    }

    /// Run the entire remaining teardown chain.
    pub fn terminate(&self) {
        self.advance_to(LifecycleState::Terminated);
    }

    /// Acknowledgment handle for delayed-protocol destinations. Cloneable
    /// and usable from any thread.
    pub fn commit_gate(&self) -> CommitGate {
        CommitGate::new(Arc::clone(&self.store), Arc::clone(&self.retry))
    }

    /// Control handle for the scheduler thread.
    pub fn scheduler_control(&self) -> SchedulerControl {
        SchedulerControl::new(Arc::clone(&self.scheduler_shared))
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn metrics(&self) -> BufferMetrics {
        self.store.metrics()
    }

    /// Ids of chunks whose delivery was given up on.
    pub fn failed_chunk_ids(&self) -> Vec<ChunkId> {
        self.store.failed_ids()
    }

    /// Take a given-up chunk off the failed shelf, content intact.
    pub fn take_failed_chunk(&self, id: ChunkId) -> Option<Chunk> {
        self.store.take_failed(id)
    }

    fn needs_scheduler(&self) -> bool {
        self.group_keys.uses_time()
            || self.mode == FlushMode::Fast
            || self.protocol == WriteProtocol::Delayed
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            store: Arc::clone(&self.store),
            destination: Arc::clone(&self.destination),
            retry: Arc::clone(&self.retry),
            clock: Arc::clone(&self.clock),
            protocol: self.protocol,
            stop: Arc::clone(&self.worker_stop),
        }
    }

    /// Walk the lifecycle forward to `target`, running the side effects of
    /// every state entered on the way. States at or before the current one
    /// are not re-entered, which makes each teardown method idempotent.
    fn advance_to(&self, target: LifecycleState) {
        let mut state = self.state.lock();
        while *state < target {
            let Some(next) = state.next() else {
                break;
            };
            self.enter(next);
            debug!(from = %*state, to = %next, "lifecycle transition");
            *state = next;
        }
    }

    fn enter(&self, state: LifecycleState) {
        match state {
            LifecycleState::Stopping => {
                self.accepting.store(false, Ordering::Release);
                info!("engine stopped accepting events");
            }
            LifecycleState::BeforeShutdown => {
                self.stop_scheduler();
            }
            LifecycleState::ShuttingDown => {
                self.stop_workers();
                let sealed = self.store.seal_all();
                debug!(sealed, "sealed remaining staged chunks for final flush");
                // The final pass attempts every queued chunk, including
                // those still parked behind a retry backoff.
                self.store.clear_backoffs();
                self.drain_queue();
            }
            LifecycleState::AfterShutdown => {
                self.destination.rollback_all();
                for id in self.store.dequeued_ids() {
                    self.store.rollback_dequeued(id, None);
                    warn!(chunk = %id, "unacknowledged delayed write force-rolled back at shutdown");
                }
            }
            LifecycleState::Closed => {
                self.store.close();
                let shelved = self.store.fail_remaining();
                if shelved > 0 {
                    error!(
                        shelved,
                        "chunks could not be delivered before close; content kept on the failed shelf"
                    );
                }
            }
            LifecycleState::Terminated => {
                info!("engine terminated");
            }
            _ => {}
        }
    }

    fn stop_scheduler(&self) {
        self.scheduler_shared.request_stop();
        if let Some(handle) = self.scheduler_thread.lock().take() {
            if handle.join().is_err() {
                error!("flush scheduler thread panicked");
            }
        }
    }

    fn stop_workers(&self) {
        self.worker_stop.store(true, Ordering::Release);
        self.store.wake_workers();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for (index, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                error!(worker = index, "flush worker thread panicked");
            }
        }
    }

    /// One synchronous pass over everything currently claimable. Chunks
    /// waiting out a retry backoff stay queued; close moves them to the
    /// failed shelf.
    fn drain_queue(&self) {
        let ctx = WorkerContext {
            stop: Arc::new(AtomicBool::new(false)),
            ..self.worker_context()
        };
        let mut drained = 0u64;
        while crate::worker::flush_once(&ctx) {
            drained += 1;
        }
        debug!(drained, "final flush pass complete");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Threads must not outlive the engine even when the embedding
        // process skips the lifecycle chain.
        self.accepting.store(false, Ordering::Release);
        self.scheduler_shared.request_stop();
        self.worker_stop.store(true, Ordering::Release);
        self.store.wake_workers();
        if let Some(handle) = self.scheduler_thread.lock().take() {
            let _ = handle.join();
        }
        for handle in std::mem::take(&mut *self.workers.lock()) {
            let _ = handle.join();
        }
    }
}

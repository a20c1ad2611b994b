//! Flush trigger evaluator
//!
//! A periodic tick walks every staged chunk and seals the ones whose flush
//! condition is met, then sweeps delayed writes past their acknowledgment
//! deadline. The tick thread is wakeable on demand and controllable through
//! an explicit pause/resume/force-tick API instead of ad-hoc flags.
//!
//! Time-keyed chunks seal against their window's end boundary plus the
//! configured grace delay, never against arrival order: a late record
//! timestamped inside a window still lands in that window as long as the
//! window has not closed yet.

use crate::retry::{RetryController, RetryVerdict};
use bufstage_config::FlushMode;
use bufstage_core::{BufferStore, MetadataKey, SharedClock, StagedChunk};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub(crate) struct FlushScheduler {
    pub(crate) store: Arc<BufferStore>,
    pub(crate) retry: Arc<RetryController>,
    pub(crate) clock: SharedClock,
    pub(crate) mode: FlushMode,
    pub(crate) flush_interval: Duration,
    pub(crate) timekey_range_secs: Option<i64>,
    pub(crate) timekey_wait: Duration,
    pub(crate) delayed_commit_timeout: Duration,
    pub(crate) tick_interval: Duration,
    pub(crate) burst_interval: Duration,
}

impl FlushScheduler {
    /// One evaluation pass. Returns the suggested sleep before the next
    /// tick: the normal tick interval, shortened toward the burst interval
    /// when a staged chunk's deadline falls inside the coming tick.
    pub(crate) fn tick(&self) -> Duration {
        let now = self.clock.now();

        let mut due: Vec<(DateTime<Utc>, MetadataKey)> = Vec::new();
        let mut nearest: Option<DateTime<Utc>> = None;
        for staged in self.store.staged_snapshot() {
            match self.seal_deadline(&staged) {
                Some(deadline) if deadline <= now => due.push((deadline, staged.key)),
                Some(deadline) => {
                    nearest = Some(nearest.map_or(deadline, |n| n.min(deadline)));
                }
                None => {}
            }
        }

        // Seal in deadline order so time windows flush in window-end order.
        due.sort();
        for (_, key) in due {
            self.store.seal(&key);
        }

        self.sweep_delayed_timeouts(now);

        match nearest {
            Some(deadline) => {
                let until = (deadline - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                until.max(self.burst_interval).min(self.tick_interval)
            }
            None => self.tick_interval,
        }
    }

    /// When the staged chunk becomes sealable, if ever.
    fn seal_deadline(&self, staged: &StagedChunk) -> Option<DateTime<Utc>> {
        if let Some(timekey) = staged.key.timekey {
            // Window closes at its end boundary plus the grace delay,
            // regardless of flush mode.
            let range = self.timekey_range_secs.unwrap_or(0);
            let window_end = Utc.timestamp_opt(timekey + range, 0).single()?;
            let wait = chrono::Duration::from_std(self.timekey_wait).ok()?;
            Some(window_end + wait)
        } else if self.mode == FlushMode::Fast {
            let interval = chrono::Duration::from_std(self.flush_interval).ok()?;
            Some(staged.created_at + interval)
        } else {
            None
        }
    }

    /// Force a rollback for every delayed write past its acknowledgment
    /// deadline, with the usual retry bookkeeping.
    fn sweep_delayed_timeouts(&self, now: DateTime<Utc>) {
        for id in self.store.expired_dequeued(self.delayed_commit_timeout) {
            match self.retry.record_failure(id, now) {
                RetryVerdict::RetryAt(not_before) => {
                    if self.store.rollback_dequeued(id, Some(not_before)) {
                        warn!(
                            chunk = %id,
                            timeout_secs = self.delayed_commit_timeout.as_secs(),
                            "delayed commit timed out; chunk rolled back for retry"
                        );
                    }
                }
                RetryVerdict::GiveUp {
                    failures,
                    first_failure,
                } => {
                    if self.store.fail_dequeued(id) {
                        error!(
                            chunk = %id,
                            failures,
                            failing_since = %first_failure,
                            "delayed commit timed out and retries are exhausted; chunk moved to failed shelf"
                        );
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct SchedulerFlags {
    stop: bool,
    force: bool,
    paused: bool,
}

pub(crate) struct SchedulerShared {
    flags: Mutex<SchedulerFlags>,
    wake: Condvar,
}

impl SchedulerShared {
    pub(crate) fn new() -> Self {
        Self {
            flags: Mutex::new(SchedulerFlags::default()),
            wake: Condvar::new(),
        }
    }

    pub(crate) fn request_stop(&self) {
        let mut flags = self.flags.lock();
        flags.stop = true;
        self.wake.notify_all();
    }
}

/// Control handle for the scheduler thread.
///
/// Pausing stops periodic evaluation without tearing the thread down;
/// `force_tick` runs one evaluation pass immediately, even while paused.
#[derive(Clone)]
pub struct SchedulerControl {
    shared: Arc<SchedulerShared>,
}

impl SchedulerControl {
    pub(crate) fn new(shared: Arc<SchedulerShared>) -> Self {
        Self { shared }
    }

    pub fn pause(&self) {
        self.shared.flags.lock().paused = true;
    }

    pub fn resume(&self) {
        let mut flags = self.shared.flags.lock();
        flags.paused = false;
        self.shared.wake.notify_all();
    }

    pub fn force_tick(&self) {
        let mut flags = self.shared.flags.lock();
        flags.force = true;
        self.shared.wake.notify_all();
    }
}

/// Scheduler thread body.
pub(crate) fn run_scheduler(scheduler: FlushScheduler, shared: Arc<SchedulerShared>) {
    debug!("flush scheduler started");
    let mut sleep = scheduler.tick_interval;
    loop {
        let run_tick = {
            let mut flags = shared.flags.lock();
            if !flags.stop && !flags.force {
                shared.wake.wait_for(&mut flags, sleep);
            }
            if flags.stop {
                break;
            }
            let forced = std::mem::take(&mut flags.force);
            forced || !flags.paused
        };

        if run_tick {
            sleep = scheduler.tick();
        } else {
            sleep = scheduler.tick_interval;
        }
    }
    debug!("flush scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use bufstage_core::{GroupKeys, ManualClock, Record};
    use chrono::TimeZone;

    struct Fixture {
        store: Arc<BufferStore>,
        clock: Arc<ManualClock>,
        scheduler: FlushScheduler,
    }

    fn fixture(mode: FlushMode, timekey_range: Option<i64>, wait_secs: u64) -> Fixture {
        let clock = Arc::new(ManualClock::at_unix(50_640)); // 14:04:00
        let store = Arc::new(BufferStore::new(1024, 1024 * 1024, clock.clone()));
        let retry = Arc::new(RetryController::new(RetryPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            None,
            Duration::from_secs(3600),
        )));
        let scheduler = FlushScheduler {
            store: store.clone(),
            retry,
            clock: clock.clone(),
            mode,
            flush_interval: Duration::from_secs(60),
            timekey_range_secs: timekey_range,
            timekey_wait: Duration::from_secs(wait_secs),
            delayed_commit_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            burst_interval: Duration::from_millis(100),
        };
        Fixture {
            store,
            clock,
            scheduler,
        }
    }

    fn emit_at(fx: &Fixture, keys: &GroupKeys, unix_secs: i64, payload: &[u8]) {
        let time = Utc.timestamp_opt(unix_secs, 0).unwrap();
        let key = keys.key_for("t", time, &Record::new(), fx.scheduler.timekey_range_secs);
        fx.store.append(&key, payload).unwrap();
    }

    #[test]
    fn test_time_windows_seal_in_window_end_order() {
        // timekey_range=30, timekey_wait=5, frozen clock at 14:04:00
        let fx = fixture(FlushMode::None, Some(30), 5);
        let keys = GroupKeys::parse(&["time"]);

        emit_at(&fx, &keys, 50_601, b"a"); // 14:03:21 -> window [14:03:00, 14:03:30)
        emit_at(&fx, &keys, 50_610, b"b"); // 14:03:30 -> window [14:03:30, 14:04:00)
        emit_at(&fx, &keys, 50_640, b"c"); // 14:04:00 -> window [14:04:00, 14:04:30)

        assert_eq!(fx.store.metrics().staged_chunks, 3);

        // At 14:04:00 the first window closed at 14:03:30; its wait deadline
        // 14:03:35 has passed. The second window's deadline is 14:04:05.
        fx.scheduler.tick();
        assert_eq!(fx.store.metrics().queued_chunks, 1);
        assert_eq!(fx.store.try_pop(false).unwrap().chunk().content(), b"a");

        fx.clock.advance_secs(5); // 14:04:05
        fx.scheduler.tick();
        assert_eq!(fx.store.try_pop(false).unwrap().chunk().content(), b"b");

        fx.clock.advance_secs(30); // 14:04:35 >= 14:04:30 + 5
        fx.scheduler.tick();
        assert_eq!(fx.store.try_pop(false).unwrap().chunk().content(), b"c");
        assert_eq!(fx.store.metrics().staged_chunks, 0);
    }

    #[test]
    fn test_window_not_sealed_during_grace_delay() {
        let fx = fixture(FlushMode::None, Some(30), 5);
        let keys = GroupKeys::parse(&["time"]);

        // Window [14:03:30, 14:04:00) closes exactly at the frozen now;
        // the grace delay keeps it staged for 5 more seconds.
        emit_at(&fx, &keys, 50_615, b"late-tolerant");
        fx.scheduler.tick();
        assert_eq!(fx.store.metrics().queued_chunks, 0);

        fx.clock.advance_secs(4);
        fx.scheduler.tick();
        assert_eq!(fx.store.metrics().queued_chunks, 0);

        fx.clock.advance_secs(1);
        fx.scheduler.tick();
        assert_eq!(fx.store.metrics().queued_chunks, 1);
    }

    #[test]
    fn test_fast_mode_seals_aged_chunks() {
        let fx = fixture(FlushMode::Fast, None, 0);
        let keys = GroupKeys::parse(&["tag"]);

        emit_at(&fx, &keys, 50_640, b"young");
        fx.scheduler.tick();
        assert_eq!(fx.store.metrics().queued_chunks, 0);

        fx.clock.advance_secs(60);
        fx.scheduler.tick();
        assert_eq!(fx.store.metrics().queued_chunks, 1);
    }

    #[test]
    fn test_none_mode_never_seals_untimed_chunks() {
        let fx = fixture(FlushMode::None, None, 0);
        let keys = GroupKeys::parse(&["tag"]);

        emit_at(&fx, &keys, 50_640, b"sits");
        fx.clock.advance_secs(86_400);
        fx.scheduler.tick();
        assert_eq!(fx.store.metrics().queued_chunks, 0);
        assert_eq!(fx.store.metrics().staged_chunks, 1);
    }

    #[test]
    fn test_tick_hint_shortens_near_deadline() {
        let fx = fixture(FlushMode::None, Some(30), 5);
        let keys = GroupKeys::parse(&["time"]);

        // Deadline at 14:04:05, now 14:04:04.8 -> hint well under a tick
        emit_at(&fx, &keys, 50_615, b"x");
        fx.clock
            .advance(chrono::Duration::milliseconds(4_800));
        let hint = fx.scheduler.tick();
        assert!(hint < fx.scheduler.tick_interval);
        assert!(hint >= fx.scheduler.burst_interval);
    }

    #[test]
    fn test_delayed_timeout_sweep_rolls_back() {
        let fx = fixture(FlushMode::Fast, None, 0);
        let keys = GroupKeys::parse(&["tag"]);

        emit_at(&fx, &keys, 50_640, b"unacked");
        fx.store.seal_all();
        let id = fx.store.try_pop(true).unwrap().id();

        // Before the deadline nothing happens
        fx.scheduler.tick();
        assert_eq!(fx.store.rollback_count(), 0);

        fx.clock.advance_secs(30);
        fx.scheduler.tick();
        assert_eq!(fx.store.rollback_count(), 1);
        assert_eq!(fx.store.metrics().dequeued_chunks, 0);
        assert_eq!(fx.store.metrics().queued_chunks, 1);

        // The retried chunk keeps its id and becomes claimable after backoff
        fx.clock.advance_secs(1);
        let reclaimed = fx.store.try_pop(true).unwrap();
        assert_eq!(reclaimed.id(), id);
    }
}

//! Retry policy and per-chunk retry state
//!
//! Backoff is exponential from a base step, capped, and a chunk gives up
//! when either the attempt ceiling or the elapsed-time ceiling trips,
//! whichever comes first. Both knobs are configuration-driven.

use bufstage_config::DeliveryConfig;
use bufstage_core::ChunkId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff with attempt and elapsed-time ceilings.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_interval: Duration,
    max_interval: Duration,
    max_attempts: Option<u32>,
    timeout: Duration,
}

impl RetryPolicy {
    pub fn new(
        base_interval: Duration,
        max_interval: Duration,
        max_attempts: Option<u32>,
        timeout: Duration,
    ) -> Self {
        Self {
            base_interval,
            max_interval,
            max_attempts,
            timeout,
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(
            config.retry_base_interval(),
            config.retry_max_interval(),
            config.retry_max_attempts,
            config.retry_timeout(),
        )
    }

    /// Backoff before attempt `failures + 1`: `base * 2^(failures-1)`,
    /// capped at `max_interval`.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        let factor = 1u32 << exponent;
        self.base_interval
            .saturating_mul(factor)
            .min(self.max_interval)
    }

    fn exhausted(&self, failures: u32, first_failure: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.max_attempts.map_or(false, |max| failures > max) {
            return true;
        }
        let elapsed = now.signed_duration_since(first_failure);
        match chrono::Duration::from_std(self.timeout) {
            Ok(timeout) => elapsed >= timeout,
            Err(_) => false,
        }
    }
}

/// Outcome of recording one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryVerdict {
    /// Retry once the backoff deadline passes
    RetryAt(DateTime<Utc>),
    /// Retries are exhausted; the chunk is permanently failed
    GiveUp {
        failures: u32,
        first_failure: DateTime<Utc>,
    },
}

struct RetryState {
    failures: u32,
    first_failure: DateTime<Utc>,
}

/// Tracks retry history per chunk id.
pub(crate) struct RetryController {
    policy: RetryPolicy,
    states: Mutex<HashMap<ChunkId, RetryState>>,
}

impl RetryController {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failed attempt and decide what happens next.
    pub(crate) fn record_failure(&self, id: ChunkId, now: DateTime<Utc>) -> RetryVerdict {
        let mut states = self.states.lock();
        let state = states.entry(id).or_insert(RetryState {
            failures: 0,
            first_failure: now,
        });
        state.failures += 1;
        let failures = state.failures;
        let first_failure = state.first_failure;

        if self.policy.exhausted(failures, first_failure, now) {
            states.remove(&id);
            RetryVerdict::GiveUp {
                failures,
                first_failure,
            }
        } else {
            let backoff = self.policy.backoff_for(failures);
            debug!(chunk = %id, failures, backoff_ms = backoff.as_millis() as u64, "retry scheduled");
            let backoff = chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::zero());
            RetryVerdict::RetryAt(now + backoff)
        }
    }

    /// Drop retry history after a successful delivery.
    pub(crate) fn forget(&self, id: ChunkId) {
        self.states.lock().remove(&id);
    }
}

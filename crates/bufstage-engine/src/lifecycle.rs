//! Lifecycle states
//!
//! Transitions are strictly sequential. Every transition is
//! idempotent-checkable: asking for a state at or before the current one is
//! a safe no-op, so teardown code can be run unconditionally.

/// Engine lifecycle, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Created,
    Configured,
    Started,
    /// New emits are rejected from here on
    Stopping,
    BeforeShutdown,
    /// Staged and queued chunks are being drained synchronously
    ShuttingDown,
    /// Unacknowledged delayed writes have been force-rolled back
    AfterShutdown,
    Closed,
    Terminated,
}

impl LifecycleState {
    /// The only state reachable from this one.
    pub fn next(self) -> Option<LifecycleState> {
        use LifecycleState::*;
        match self {
            Created => Some(Configured),
            Configured => Some(Started),
            Started => Some(Stopping),
            Stopping => Some(BeforeShutdown),
            BeforeShutdown => Some(ShuttingDown),
            ShuttingDown => Some(AfterShutdown),
            AfterShutdown => Some(Closed),
            Closed => Some(Terminated),
            Terminated => None,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Configured => "configured",
            LifecycleState::Started => "started",
            LifecycleState::Stopping => "stopping",
            LifecycleState::BeforeShutdown => "before_shutdown",
            LifecycleState::ShuttingDown => "shutting_down",
            LifecycleState::AfterShutdown => "after_shutdown",
            LifecycleState::Closed => "closed",
            LifecycleState::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_chain_is_total_and_ordered() {
        let mut state = LifecycleState::Created;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            assert!(state < next);
            state = next;
            seen.push(state);
        }
        assert_eq!(state, LifecycleState::Terminated);
        assert_eq!(seen.len(), 9);
    }
}

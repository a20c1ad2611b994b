//! Engine error type

use crate::lifecycle::LifecycleState;
use bufstage_config::ConfigError;
use bufstage_core::BufferError;
use thiserror::Error;

/// Errors surfaced by the engine's public surface
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration rejected before start
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Buffer store rejected the operation (overflow, closed)
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Emit after stop, or before start
    #[error("engine is not accepting events (state: {0})")]
    NotAccepting(LifecycleState),

    /// Lifecycle methods called out of order
    #[error("invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    /// Worker or scheduler thread could not be spawned
    #[error("failed to spawn {role} thread: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },
}

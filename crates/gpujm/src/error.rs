use thiserror::Error;

use crate::reset::ResetState;

pub type Result<T> = std::result::Result<T, JmError>;

/// Errors surfaced by the job manager.
///
/// Hardware job faults are not errors at this level: they are delivered per atom as a
/// [`crate::CompletionCode`]. Contract violations (submitting into an occupied slot, an
/// out-of-range slot index) panic.
#[derive(Debug, Error)]
pub enum JmError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("reset transition to {to:?} rejected in state {from:?}")]
    InvalidResetTransition { from: ResetState, to: ResetState },

    #[error("hardware reset failed: {0}")]
    HardwareReset(String),

    #[error("reset worker unavailable")]
    WorkerUnavailable,

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

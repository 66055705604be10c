//! Error taxonomy shared by the whole engine.
//!
//! Every kind is fatal at the rank that detects it: callers propagate with `?`
//! up to the driver, which logs the failing task and aborts the run. Nothing
//! here is recovered silently.

use thiserror::Error;

use crate::channels::DataKind;

/// Fatal simulation errors.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Bad registration or wiring: duplicate/reserved name, unknown component,
    /// bouncer without integrator, wrong particle-vector subtype.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A structural invariant was broken at runtime (cell-list estimate
    /// exceeded, non-empty self-message, object-size mismatch, graph cycle).
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A communicator call failed (peer gone, receive timed out).
    #[error("exchange error: {0}")]
    Exchange(String),

    /// A channel was re-created with a different element type.
    #[error("channel '{name}' already exists as {existing:?}, requested {requested:?}")]
    ChannelTypeConflict {
        /// Channel name.
        name: String,
        /// Kind the channel was first created with.
        existing: DataKind,
        /// Kind of the conflicting creation attempt.
        requested: DataKind,
    },

    /// Missing or malformed restart record.
    #[error("restart error: {0}")]
    Restart(String),

    /// Underlying I/O failure (checkpoint folders, graph export).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience alias used across both crates.
pub type Result<T> = std::result::Result<T, SimulationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offender() {
        let err = SimulationError::ChannelTypeConflict {
            name: "densities".to_string(),
            existing: DataKind::Float,
            requested: DataKind::Float3,
        };
        let msg = err.to_string();
        assert!(msg.contains("densities"));
        assert!(msg.contains("Float3"));
    }
}

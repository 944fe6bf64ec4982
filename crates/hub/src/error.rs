//! Control-plane error taxonomy.
//!
//! Encoding/validation problems fail fast to the immediate caller. Device
//! faults and verification timeouts are *not* errors here; they land in
//! the owning FSM's ERROR state and stay there until an explicit reset.
//! Busy and no-op skips are ordinary outcomes, carried as data by
//! [`crate::fsm::JobOutcome`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// Malformed command for the target device kind. Rejected before any
    /// registers are written.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Device returned a state block we cannot interpret.
    #[error("bad state registers: {0}")]
    Decode(String),

    /// Network/IO failure talking to the register bus.
    #[error("transport: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, ControlError>;

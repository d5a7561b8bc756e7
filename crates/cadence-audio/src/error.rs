//! Error types for audio streaming.
//!
//! Read outcomes such as overrun or end of stream are not errors; see
//! [`ReadOutcome`](crate::ring::ReadOutcome).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    #[error("Ring stream capacity must be greater than zero")]
    ZeroCapacity,

    #[error("A writer was already created for this stream")]
    WriterAlreadyCreated,

    #[error("Write after the writer was closed")]
    WriterClosed,

    #[error("Read after the reader was closed")]
    ReaderClosed,

    /// The requested start position is no longer (or not yet) buffered.
    #[error("Position {requested} is outside the buffered window {oldest}..={newest}")]
    PositionOutOfWindow {
        requested: u64,
        oldest: u64,
        newest: u64,
    },

    /// The capture source failed.
    #[error("Audio source error: {0}")]
    Source(String),
}

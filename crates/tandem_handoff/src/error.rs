//! # Handoff Error Types

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::slot::SnapshotSlot;

/// Errors building slots or channels.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandoffError {
    /// The three arrays differ in length.
    #[error("mismatched array lengths: {positions} positions, {velocities} velocities, {ids} ids")]
    MismatchedLengths {
        /// Positions supplied.
        positions: usize,
        /// Velocities supplied.
        velocities: usize,
        /// Identifiers supplied.
        ids: usize,
    },

    /// Valid-element count larger than the arrays.
    #[error("element count {count} exceeds array length {len}")]
    CountOutOfRange {
        /// Requested count.
        count: usize,
        /// Array length.
        len: usize,
    },

    /// Invalid channel configuration.
    #[error("invalid handoff configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for slot and channel construction.
pub type HandoffResult<T> = Result<T, HandoffError>;

/// A publish that did not hand the slot over. The slot comes back.
#[derive(Error, Debug)]
pub enum PublishError {
    /// A snapshot is still pending or being drained.
    #[error("handoff slot occupied")]
    Occupied(SnapshotSlot),

    /// The consumer is gone; nobody will drain the slot.
    #[error("handoff consumer disconnected")]
    Disconnected(SnapshotSlot),
}

impl PublishError {
    /// Returns the rejected slot.
    #[must_use]
    pub fn into_slot(self) -> SnapshotSlot {
        match self {
            Self::Occupied(slot) | Self::Disconnected(slot) => slot,
        }
    }
}

/// Errors from the snapshot writer.
#[derive(Error, Debug)]
pub enum WriterError {
    /// File system failure.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Cause.
        source: io::Error,
    },

    /// File contents are not a snapshot this writer produced.
    #[error("malformed snapshot {}: {reason}", .path.display())]
    Malformed {
        /// File involved.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// The slot read back is inconsistent.
    #[error(transparent)]
    Slot(#[from] HandoffError),

    /// The writer thread could not be started.
    #[error("failed to spawn writer thread: {0}")]
    Spawn(io::Error),

    /// The writer thread panicked.
    #[error("writer thread panicked")]
    Panicked,
}

/// Result type for writer operations.
pub type WriterResult<T> = Result<T, WriterError>;

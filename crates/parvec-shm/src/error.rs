//! Shared-memory error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from creating, attaching to or accessing a [`SharedArena`](crate::SharedArena).
#[derive(Debug, Error)]
pub enum ShmError {
    /// Creating, sizing or mapping the backing file failed.
    #[error("shared memory I/O on {path:?}: {source}")]
    Io {
        /// Backing file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The backing file does not have the size the layout requires.
    #[error("backing file is {actual} bytes, layout requires {expected}")]
    SizeMismatch {
        /// Size implied by layout and slot count.
        expected: u64,
        /// Size on disk.
        actual: u64,
    },
    /// A layout entry was declared twice.
    #[error("duplicate layout entry '{key}'")]
    DuplicateEntry {
        /// The repeated key.
        key: String,
    },
    /// A key not present in the layout was requested.
    #[error("unknown layout entry '{key}'")]
    UnknownEntry {
        /// The requested key.
        key: String,
    },
    /// Slot index out of range.
    #[error("slot {slot} out of range (num_slots={num_slots})")]
    InvalidSlot {
        /// Requested slot.
        slot: usize,
        /// Number of slots.
        num_slots: usize,
    },
    /// A process tried to write a slot it does not own.
    #[error("slot {slot} is not writable from this process (owner: {owner})")]
    NotOwner {
        /// Requested slot.
        slot: usize,
        /// Description of the caller's role.
        owner: String,
    },
}

//! Shared-memory slot arena for parvec worker processes.
//!
//! One file-backed mapping holds `num_slots` equally sized slots. Slot `i`
//! belongs to worker `i`: only that worker writes it, and the orchestrator
//! reads it only after the worker has replied to the command that filled
//! it. Slots never overlap, so no locking is involved.
//!
//! ```text
//! SharedArena (orchestrator, creates + owns the backing file)
//! ├── SlotLayout: key → (offset, len) inside one slot, plus the stride
//! └── mapping: [ slot 0 | slot 1 | ... | slot n-1 ]
//!
//! SharedArena (worker i, attaches by path, may write slot i only)
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

pub mod arena;
pub mod error;
pub mod layout;
mod raw;

pub use arena::{ArenaRole, SharedArena};
pub use error::ShmError;
pub use layout::SlotLayout;

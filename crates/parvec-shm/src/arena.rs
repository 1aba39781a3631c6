//! The shared slot arena.

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::ShmError;
use crate::layout::SlotLayout;
use crate::raw::map_file;

/// Which side of the arena this handle is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArenaRole {
    /// The creating process. Reads any slot, writes none.
    Orchestrator,
    /// A worker attached to the arena. Writes only its own slot.
    Worker {
        /// The slot this worker owns.
        slot: usize,
    },
}

impl fmt::Display for ArenaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArenaRole::Orchestrator => write!(f, "orchestrator"),
            ArenaRole::Worker { slot } => write!(f, "worker {slot}"),
        }
    }
}

/// A file-backed mapping split into `num_slots` disjoint slots.
///
/// The orchestrator [creates](Self::create) the arena, which owns the
/// backing file and removes it on drop. Workers [attach](Self::attach) by
/// path.
pub struct SharedArena {
    mmap: MmapMut,
    layout: SlotLayout,
    num_slots: usize,
    role: ArenaRole,
    path: PathBuf,
    /// Keeps the backing file alive for the orchestrator.
    _owned: Option<NamedTempFile>,
}

impl SharedArena {
    /// Create a zeroed arena with `num_slots` slots of `layout`.
    ///
    /// The backing file lives in `/dev/shm` when available, otherwise in
    /// the system temp directory.
    pub fn create(layout: SlotLayout, num_slots: usize) -> Result<Self, ShmError> {
        let dir = shm_dir();
        let file = tempfile::Builder::new()
            .prefix("parvec-")
            .suffix(".shm")
            .tempfile_in(&dir)
            .map_err(|source| ShmError::Io {
                path: dir.clone(),
                source,
            })?;
        let path = file.path().to_path_buf();
        let len = mapped_len(&layout, num_slots);
        file.as_file()
            .set_len(len as u64)
            .map_err(|source| ShmError::Io {
                path: path.clone(),
                source,
            })?;
        let mmap = map_file(file.as_file(), len).map_err(|source| ShmError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(
            path = %path.display(),
            num_slots,
            stride = layout.stride(),
            "created shared arena"
        );

        Ok(Self {
            mmap,
            layout,
            num_slots,
            role: ArenaRole::Orchestrator,
            path,
            _owned: Some(file),
        })
    }

    /// Attach to an existing arena as the owner of `slot`.
    ///
    /// Fails if the backing file's size does not match `layout` and
    /// `num_slots`.
    pub fn attach(
        path: &Path,
        layout: SlotLayout,
        num_slots: usize,
        slot: usize,
    ) -> Result<Self, ShmError> {
        if slot >= num_slots {
            return Err(ShmError::InvalidSlot { slot, num_slots });
        }
        let io_err = |source| ShmError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)?;
        let expected = mapped_len(&layout, num_slots) as u64;
        let actual = file.metadata().map_err(io_err)?.len();
        if actual != expected {
            return Err(ShmError::SizeMismatch { expected, actual });
        }
        let mmap = map_file(&file, expected as usize).map_err(io_err)?;

        debug!(path = %path.display(), slot, "attached to shared arena");

        Ok(Self {
            mmap,
            layout,
            num_slots,
            role: ArenaRole::Worker { slot },
            path: path.to_path_buf(),
            _owned: None,
        })
    }

    /// Path of the backing file, handed to workers.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The per-slot layout.
    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// Number of slots.
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// This handle's role.
    pub fn role(&self) -> ArenaRole {
        self.role
    }

    /// Read the block `key` of `slot`.
    pub fn block(&self, slot: usize, key: &str) -> Result<&[u8], ShmError> {
        let range = self.range(slot, key)?;
        Ok(&self.mmap[range])
    }

    /// Mutable access to the block `key` of `slot`.
    ///
    /// Only the worker owning `slot` may write it.
    pub fn block_mut(&mut self, slot: usize, key: &str) -> Result<&mut [u8], ShmError> {
        if self.role != (ArenaRole::Worker { slot }) {
            return Err(ShmError::NotOwner {
                slot,
                owner: self.role.to_string(),
            });
        }
        let range = self.range(slot, key)?;
        Ok(&mut self.mmap[range])
    }

    fn range(&self, slot: usize, key: &str) -> Result<std::ops::Range<usize>, ShmError> {
        if slot >= self.num_slots {
            return Err(ShmError::InvalidSlot {
                slot,
                num_slots: self.num_slots,
            });
        }
        let (offset, len) = self.layout.entry(key)?;
        let start = slot * self.layout.stride() + offset;
        Ok(start..start + len)
    }
}

impl fmt::Debug for SharedArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedArena")
            .field("path", &self.path)
            .field("num_slots", &self.num_slots)
            .field("stride", &self.layout.stride())
            .field("role", &self.role)
            .finish()
    }
}

fn shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Zero-length mappings are rejected by the OS.
fn mapped_len(layout: &SlotLayout, num_slots: usize) -> usize {
    layout.total_len(num_slots).max(1)
}

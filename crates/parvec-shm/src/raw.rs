//! The one place the arena touches `unsafe`.

#![allow(unsafe_code)]

use std::fs::File;
use std::io;

use memmap2::{MmapMut, MmapOptions};

/// Map `len` bytes of `file` read-write.
pub(crate) fn map_file(file: &File, len: usize) -> io::Result<MmapMut> {
    // SAFETY: the backing file is private to one vector runner and its
    // workers. It is never truncated while mapped, and each process only
    // writes the slot it owns.
    unsafe { MmapOptions::new().len(len).map_mut(file) }
}

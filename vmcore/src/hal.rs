//! Collaborator traits.
//!
//! The VM core never touches hardware or the filesystem directly; the
//! enclosing kernel hands in trait objects for the page directory, backing
//! files, the swap block device and the physical frame allocator. A hosted
//! test harness implements the same traits over plain memory.

use alloc::sync::Arc;
use bitflags::bitflags;

use crate::{Kva, Uva, PAGE_SIZE};

bitflags! {
    /// Behavior requested from the frame allocator.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Return the frame zero-filled.
        const ZERO = 1 << 0;
    }
}

/// One process's hardware page directory.
///
/// `accessed` and `dirty` report the hardware-maintained bits for a mapped
/// page; both read as false for an unmapped page.
pub trait PageDirectory: Send + Sync {
    /// Map `uva` to the frame at `kva`. Fails if `uva` is already mapped.
    fn install(&self, uva: Uva, kva: Kva, writable: bool) -> bool;
    /// Remove the mapping at `uva`, if any.
    fn clear(&self, uva: Uva);
    /// Kernel address of the frame backing `uva`, if mapped.
    fn translate(&self, uva: Uva) -> Option<Kva>;
    fn accessed(&self, uva: Uva) -> bool;
    fn dirty(&self, uva: Uva) -> bool;
    fn set_accessed(&self, uva: Uva, accessed: bool);
}

/// A file usable as page backing store.
///
/// Positioned reads and writes only; the core never moves a cursor. The
/// handle closes when the last reference to it drops.
pub trait BackingFile: Send + Sync {
    /// Read at most `buf.len()` bytes starting at `ofs`; returns the count
    /// actually read.
    fn read_at(&self, buf: &mut [u8], ofs: u64) -> usize;
    /// Write `buf` starting at `ofs`; returns the count actually written.
    fn write_at(&self, buf: &[u8], ofs: u64) -> usize;
    /// Current length in bytes.
    fn length(&self) -> u64;
    /// Open an independent handle onto the same file, so the caller's
    /// lifetime and cursor are decoupled from the original descriptor.
    fn reopen(&self) -> Arc<dyn BackingFile>;
}

/// The swap block device: fixed-size sector I/O, nothing else.
pub trait BlockDevice: Send + Sync {
    /// Sector size in bytes; must divide [`PAGE_SIZE`].
    fn sector_size(&self) -> usize;
    /// Device capacity in sectors.
    fn sector_count(&self) -> u64;
    fn read(&self, sector: u64, buf: &mut [u8]);
    fn write(&self, sector: u64, buf: &[u8]);
}

/// The paged physical allocator for user frames.
pub trait FramePool: Send + Sync {
    /// Allocate one page-sized frame, or `None` when the pool is empty.
    fn alloc(&self, flags: AllocFlags) -> Option<Kva>;
    /// Return a frame previously handed out by `alloc`.
    fn free(&self, kva: Kva);
}

/// View a frame's contents through its kernel address.
///
/// Callers must hold the only live reference to the frame's contents for
/// the duration of the borrow (the frame lock, or sole ownership of a page
/// that is not yet, or no longer, mapped).
pub(crate) unsafe fn frame_bytes<'a>(kva: Kva) -> &'a [u8] {
    core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE)
}

pub(crate) unsafe fn frame_bytes_mut<'a>(kva: Kva) -> &'a mut [u8] {
    core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_SIZE)
}

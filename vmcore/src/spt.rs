//! Supplemental page table.
//!
//! Per-process map from a page-aligned user address to a page descriptor:
//! what kind of backing the page has, whether it is resident, and where the
//! contents live when it is not. The hardware page directory answers "is it
//! mapped"; this table answers "what do I do about it".

use alloc::sync::Arc;
use hashbrown::HashMap;

use crate::frame::FrameId;
use crate::hal::BackingFile;
use crate::swap::SwapSlot;
use crate::{Kva, Uva, VmError};

/// Where a page's contents come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    /// Read from a range of the program image; discarded on eviction and
    /// re-read on the next fault (unless written, in which case the page
    /// moves to swap).
    Exec,
    /// Mirrors a range of a user-mapped file; dirty pages are written back
    /// on eviction and unmap. Never occupies swap.
    MmFile,
    /// Anonymous (stack/heap); non-resident contents live in a swap slot.
    Swap,
}

/// A page descriptor.
///
/// Residency invariant: `resident`, `kva` and `frame` are all set or all
/// clear, together. A non-resident `Swap` page names an occupied swap slot;
/// a non-resident `Exec`/`MmFile` page is fully determined by
/// `(file, ofs, read_bytes)` with a zero-filled tail.
pub struct PageEntry {
    pub uva: Uva,
    pub kind: PageKind,
    pub resident: bool,
    pub kva: Option<Kva>,
    pub frame: Option<FrameId>,
    pub writable: bool,
    pub file: Option<Arc<dyn BackingFile>>,
    pub ofs: u64,
    pub read_bytes: usize,
    pub swap_slot: Option<SwapSlot>,
}

impl PageEntry {
    /// Non-resident executable-image page.
    pub fn exec(
        file: Arc<dyn BackingFile>,
        ofs: u64,
        uva: Uva,
        read_bytes: usize,
        writable: bool,
    ) -> Self {
        PageEntry {
            uva,
            kind: PageKind::Exec,
            resident: false,
            kva: None,
            frame: None,
            writable,
            file: Some(file),
            ofs,
            read_bytes,
            swap_slot: None,
        }
    }

    /// Non-resident mapped-file page.
    pub fn mmfile(
        file: Arc<dyn BackingFile>,
        ofs: u64,
        uva: Uva,
        read_bytes: usize,
        writable: bool,
    ) -> Self {
        PageEntry {
            kind: PageKind::MmFile,
            ..PageEntry::exec(file, ofs, uva, read_bytes, writable)
        }
    }

    /// Anonymous page born resident (stack growth).
    pub fn anon_resident(uva: Uva, kva: Kva, frame: FrameId) -> Self {
        PageEntry {
            uva,
            kind: PageKind::Swap,
            resident: true,
            kva: Some(kva),
            frame: Some(frame),
            writable: true,
            file: None,
            ofs: 0,
            read_bytes: 0,
            swap_slot: None,
        }
    }

    /// Bind the descriptor to a frame. Consumes the swap slot reference:
    /// swap-in has already freed the slot by the time contents are live.
    pub fn mark_resident(&mut self, kva: Kva, frame: FrameId) {
        self.resident = true;
        self.kva = Some(kva);
        self.frame = Some(frame);
        self.swap_slot = None;
    }

    /// Unbind after the contents went to `slot`; the page is anonymous from
    /// here on, whatever it started as.
    pub fn mark_swapped_out(&mut self, slot: SwapSlot) {
        self.resident = false;
        self.kva = None;
        self.frame = None;
        self.kind = PageKind::Swap;
        self.swap_slot = Some(slot);
    }

    /// Unbind with no copy-out; the backing file re-creates the contents.
    pub fn mark_discarded(&mut self) {
        debug_assert!(matches!(self.kind, PageKind::Exec | PageKind::MmFile));
        self.resident = false;
        self.kva = None;
        self.frame = None;
    }
}

/// The per-process table. Hash-keyed on the page address: the fault path
/// does one lookup per fault and must not pay for an ordered walk.
pub struct Spt {
    pages: HashMap<Uva, PageEntry>,
}

impl Spt {
    pub fn new() -> Self {
        Spt {
            pages: HashMap::new(),
        }
    }

    /// Insert a descriptor; refuses to shadow an existing page.
    pub fn insert(&mut self, entry: PageEntry) -> Result<(), VmError> {
        debug_assert!(crate::is_page_aligned(entry.uva));
        match self.pages.entry(entry.uva) {
            hashbrown::hash_map::Entry::Occupied(_) => Err(VmError::Overlap),
            hashbrown::hash_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    pub fn get(&self, uva: Uva) -> Option<&PageEntry> {
        self.pages.get(&uva)
    }

    pub fn get_mut(&mut self, uva: Uva) -> Option<&mut PageEntry> {
        self.pages.get_mut(&uva)
    }

    pub fn contains(&self, uva: Uva) -> bool {
        self.pages.contains_key(&uva)
    }

    pub fn remove(&mut self, uva: Uva) -> Option<PageEntry> {
        self.pages.remove(&uva)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.pages.values()
    }

    /// Drain every descriptor (process exit).
    pub fn drain(&mut self) -> impl Iterator<Item = PageEntry> + '_ {
        self.pages.drain().map(|(_, entry)| entry)
    }
}

//! The VM core: fault resolution, lazy loading, eviction, mapped files and
//! process teardown, all hanging off one [`VmCore`] value.
//!
//! Lock order, outermost first: process registry, frame table, SPT, swap.
//! The frame lock is never requested while an SPT lock is held — the fault
//! path copies descriptor state out, drops its SPT lock, allocates (which
//! may evict under the frame lock, taking the victim's SPT and the swap
//! lock inside), then reacquires its own SPT lock to commit. File I/O done
//! while evicting or unmapping runs under the frame lock, so any filesystem
//! lock inside a [`BackingFile`] is ordered after it.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::frame::{FrameId, FrameTable};
use crate::hal::{
    frame_bytes, frame_bytes_mut, AllocFlags, BackingFile, BlockDevice, FramePool, PageDirectory,
};
use crate::mmap::{MapId, MmapRegistry};
use crate::spt::{PageEntry, PageKind, Spt};
use crate::swap::SwapStore;
use crate::{
    is_page_aligned, page_offset, page_round_down, Kva, Pid, Uva, VmError, PAGE_SIZE, USER_TOP,
};

/// Faulting this far below the stack pointer still grows the stack: PUSHA
/// stores 32 bytes below SP before the fault is taken, PUSH 4.
const STACK_REACH: u64 = 32;

/// One process's view of the core: identity, page directory, supplemental
/// page table and mapping registry.
pub struct ProcessVm {
    pub pid: Pid,
    pub pagedir: Arc<dyn PageDirectory>,
    pub(crate) spt: Mutex<Spt>,
    pub(crate) mmaps: Mutex<MmapRegistry>,
}

impl ProcessVm {
    pub(crate) fn new(pid: Pid, pagedir: Arc<dyn PageDirectory>) -> Self {
        ProcessVm {
            pid,
            pagedir,
            spt: Mutex::new(Spt::new()),
            mmaps: Mutex::new(MmapRegistry::new()),
        }
    }
}

/// Point-in-time snapshot of the core's counters.
#[derive(Clone, Copy, Debug)]
pub struct VmStats {
    pub resident_frames: usize,
    pub swap_slots_used: usize,
    pub swap_slot_count: usize,
    pub faults_served: u64,
    pub evictions: u64,
    pub pages_swapped_out: u64,
    pub pages_swapped_in: u64,
}

pub struct VmCore {
    pool: Arc<dyn FramePool>,
    frames: Mutex<FrameTable>,
    swap: Mutex<SwapStore>,
    procs: Mutex<BTreeMap<Pid, Arc<ProcessVm>>>,
    faults: AtomicU64,
}

impl VmCore {
    /// Build the core around its collaborators. Swap geometry comes from
    /// the device; the frame pool is shared with the enclosing kernel.
    pub fn new(device: Arc<dyn BlockDevice>, pool: Arc<dyn FramePool>) -> Self {
        let swap = SwapStore::new(device);
        log::info!("vm: core ready, {} swap slots", swap.slot_count());
        VmCore {
            pool,
            frames: Mutex::new(FrameTable::new()),
            swap: Mutex::new(swap),
            procs: Mutex::new(BTreeMap::new()),
            faults: AtomicU64::new(0),
        }
    }

    /// Register a process and its page directory. Every other entry point
    /// names the process by this `pid`.
    pub fn attach_process(&self, pid: Pid, pagedir: Arc<dyn PageDirectory>) {
        let prev = self
            .procs
            .lock()
            .insert(pid, Arc::new(ProcessVm::new(pid, pagedir)));
        assert!(prev.is_none(), "process attached twice");
        log::debug!("vm: attached pid={}", pid);
    }

    /// Tear down a process's address space on exit: unmap every live file
    /// mapping (writing dirty pages back and closing the private handles),
    /// then release remaining frames and swap slots.
    pub fn detach_process(&self, pid: Pid) {
        let proc = self
            .procs
            .lock()
            .remove(&pid)
            .expect("process not attached to the VM core");

        let maps = proc.mmaps.lock().drain_all();
        for mf in &maps {
            self.unmap_range(&proc, mf.base, mf.pages);
        }
        drop(maps);

        let mut frames = self.frames.lock();
        let mut spt = proc.spt.lock();
        let leftovers: Vec<PageEntry> = spt.drain().collect();
        for entry in leftovers {
            self.drop_entry(&mut frames, &proc, entry);
        }
        log::info!("vm: detached pid={}", pid);
    }

    fn process(&self, pid: Pid) -> Arc<ProcessVm> {
        self.procs
            .lock()
            .get(&pid)
            .cloned()
            .expect("process not attached to the VM core")
    }

    /// Resolve a user page fault at `va` with stack pointer `sp`.
    ///
    /// `Ok(())` means the faulting access can be retried. Any error means
    /// the address space cannot honestly satisfy the access and the caller
    /// must terminate the process.
    pub fn handle_fault(
        &self,
        pid: Pid,
        va: u64,
        sp: u64,
        user: bool,
        write: bool,
    ) -> Result<(), VmError> {
        if va >= USER_TOP {
            log::debug!(
                "vm: fault outside user space pid={} va={:#x} user={} write={}",
                pid,
                va,
                user,
                write
            );
            return Err(VmError::BadAddress);
        }

        let proc = self.process(pid);
        let uva = page_round_down(va);
        let known = {
            let spt = proc.spt.lock();
            spt.get(uva).map(|e| (e.resident, e.writable))
        };

        match known {
            Some((_, writable)) if write && !writable => return Err(VmError::BadAddress),
            // Already resident: a stale TLB entry or a mapping that raced
            // in; the retry will succeed as-is.
            Some((true, _)) => {}
            Some((false, _)) => self.load_page(&proc, uva)?,
            None if va >= sp.saturating_sub(STACK_REACH) => self.stack_grow(&proc, uva)?,
            None => {
                log::debug!("vm: unresolvable fault pid={} va={:#x}", pid, va);
                return Err(VmError::BadAddress);
            }
        }

        self.faults.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Create a resident, writable, zeroed anonymous page at `uva`.
    pub fn grow_stack(&self, pid: Pid, uva: Uva) -> Result<(), VmError> {
        if !is_page_aligned(uva) || uva >= USER_TOP {
            return Err(VmError::InvalidArgs);
        }
        let proc = self.process(pid);
        self.stack_grow(&proc, uva)
    }

    /// Record an executable segment for demand loading: one descriptor per
    /// page, no frames touched until the first fault.
    ///
    /// `ofs` and `base_uva` must be page-aligned and `read_bytes +
    /// zero_bytes` a whole number of pages; the loader computed them, so a
    /// violation is a kernel bug.
    pub fn load_exec_segment(
        &self,
        pid: Pid,
        file: &Arc<dyn BackingFile>,
        ofs: u64,
        base_uva: Uva,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        self.lazy_map(
            pid,
            file,
            ofs,
            base_uva,
            read_bytes,
            zero_bytes,
            writable,
            PageKind::Exec,
        )
    }

    /// The mapped-file counterpart of [`Self::load_exec_segment`]: cover a
    /// page-aligned range with mapped-file descriptors, touching no frames.
    #[allow(clippy::too_many_arguments)]
    pub fn load_mmap_segment(
        &self,
        pid: Pid,
        file: &Arc<dyn BackingFile>,
        ofs: u64,
        base_uva: Uva,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        self.lazy_map(
            pid,
            file,
            ofs,
            base_uva,
            read_bytes,
            zero_bytes,
            writable,
            PageKind::MmFile,
        )
    }

    /// Map a file into user space. The file is re-opened so the mapping
    /// survives the caller closing its descriptor; the mapping covers the
    /// whole file, rounded up to whole pages with a zero tail.
    pub fn mmap(&self, pid: Pid, file: &Arc<dyn BackingFile>, addr: Uva) -> Result<MapId, VmError> {
        if addr == 0 || !is_page_aligned(addr) {
            return Err(VmError::InvalidArgs);
        }
        let len = file.length();
        if len == 0 {
            return Err(VmError::InvalidArgs);
        }
        let read_bytes = len as usize;
        let zero_bytes = (PAGE_SIZE - read_bytes % PAGE_SIZE) % PAGE_SIZE;
        let span = (read_bytes + zero_bytes) as u64;
        if addr.checked_add(span).map_or(true, |end| end > USER_TOP) {
            return Err(VmError::InvalidArgs);
        }

        let mapping = file.reopen();
        self.load_mmap_segment(pid, &mapping, 0, addr, read_bytes, zero_bytes, true)?;

        let pages = (read_bytes + zero_bytes) / PAGE_SIZE;
        let proc = self.process(pid);
        let id = proc.mmaps.lock().insert(addr, pages, mapping);
        log::debug!("vm: mmap pid={} id={} base={:#x} pages={}", pid, id, addr, pages);
        Ok(id)
    }

    /// Remove a mapping: write dirty resident pages back (exactly the bytes
    /// the page mirrors, not the zero tail), release frames and
    /// descriptors, close the private handle.
    pub fn munmap(&self, pid: Pid, id: MapId) -> Result<(), VmError> {
        let proc = self.process(pid);
        let mf = proc
            .mmaps
            .lock()
            .remove(id)
            .ok_or(VmError::InvalidArgs)?;
        self.unmap_range(&proc, mf.base, mf.pages);
        log::debug!("vm: munmap pid={} id={}", pid, id);
        Ok(())
    }

    /// Hardware translation for `va`, for callers that validate user
    /// pointers before dereferencing them on the kernel side.
    pub fn translate(&self, pid: Pid, va: u64) -> Option<Kva> {
        if va >= USER_TOP {
            return None;
        }
        let proc = self.process(pid);
        proc.pagedir
            .translate(page_round_down(va))
            .map(|kva| kva + page_offset(va))
    }

    /// Number of pages the process has descriptors for, resident or not.
    pub fn mapped_pages(&self, pid: Pid) -> usize {
        self.process(pid).spt.lock().len()
    }

    pub fn stats(&self) -> VmStats {
        let frames = self.frames.lock();
        let swap = self.swap.lock();
        VmStats {
            resident_frames: frames.len(),
            swap_slots_used: swap.slots_used(),
            swap_slot_count: swap.slot_count(),
            faults_served: self.faults.load(Ordering::Relaxed),
            evictions: frames.evictions(),
            pages_swapped_out: swap.pages_out(),
            pages_swapped_in: swap.pages_in(),
        }
    }

    /// Cross-check the frame table, every attached process and the swap
    /// bitmap; panics if they disagree. For tests and debug shells, not
    /// hot paths.
    pub fn check_consistency(&self) {
        let procs = self.procs.lock();
        let frames = self.frames.lock();
        let swap = self.swap.lock();

        for (id, fte) in frames.iter() {
            let spt = fte.owner.spt.lock();
            let entry = spt
                .get(fte.uva)
                .expect("frame backs a page with no descriptor");
            assert!(entry.resident, "frame backs a non-resident page");
            assert_eq!(entry.kva, Some(fte.kva), "frame and descriptor kva disagree");
            assert_eq!(entry.frame, Some(id), "descriptor names the wrong frame");
        }

        let mut resident = 0usize;
        let mut swapped = 0usize;
        let mut slots = BTreeSet::new();
        for proc in procs.values() {
            let spt = proc.spt.lock();
            for entry in spt.iter() {
                if entry.resident {
                    resident += 1;
                    let id = entry.frame.expect("resident page without a frame");
                    let fte = frames.get(id).expect("descriptor names a dead frame");
                    assert_eq!((fte.owner.pid, fte.uva), (proc.pid, entry.uva));
                } else if entry.kind == PageKind::Swap {
                    let slot = entry.swap_slot.expect("anonymous page with no swap slot");
                    assert!(swap.slot_in_use(slot), "descriptor names a free swap slot");
                    assert!(slots.insert(slot), "two pages share a swap slot");
                    swapped += 1;
                }
            }
        }
        assert_eq!(resident, frames.len(), "resident pages and frame table disagree");
        assert_eq!(swapped, swap.slots_used(), "swap occupancy and descriptors disagree");
    }

    // ------------------------------------------------------------------
    // Fault-path internals
    // ------------------------------------------------------------------

    /// Bring a non-resident descriptor to residency.
    fn load_page(&self, proc: &Arc<ProcessVm>, uva: Uva) -> Result<(), VmError> {
        let (kind, writable, file, ofs, read_bytes, slot) = {
            let spt = proc.spt.lock();
            let e = spt.get(uva).expect("loading a page with no descriptor");
            debug_assert!(!e.resident);
            (e.kind, e.writable, e.file.clone(), e.ofs, e.read_bytes, e.swap_slot)
        };

        match kind {
            PageKind::Exec | PageKind::MmFile => {
                let file = file.expect("file-backed page without a file");
                let (frame_id, kva) = self.frame_alloc(proc, uva, AllocFlags::empty());
                let page = unsafe { frame_bytes_mut(kva) };
                if file.read_at(&mut page[..read_bytes], ofs) != read_bytes {
                    self.frame_discard(frame_id);
                    return Err(VmError::IoShort);
                }
                page[read_bytes..].fill(0);
                if !proc.pagedir.install(uva, kva, writable) {
                    self.frame_discard(frame_id);
                    return Err(VmError::BadAddress);
                }
                self.commit_resident(proc, uva, kva, frame_id);
            }
            PageKind::Swap => {
                let slot = slot.expect("anonymous page with no swap slot");
                let (frame_id, kva) = self.frame_alloc(proc, uva, AllocFlags::empty());
                if !proc.pagedir.install(uva, kva, writable) {
                    self.frame_discard(frame_id);
                    return Err(VmError::BadAddress);
                }
                self.swap.lock().swap_in(kva, slot);
                self.commit_resident(proc, uva, kva, frame_id);
            }
        }
        Ok(())
    }

    fn stack_grow(&self, proc: &Arc<ProcessVm>, uva: Uva) -> Result<(), VmError> {
        debug_assert!(is_page_aligned(uva));
        let (frame_id, kva) = self.frame_alloc(proc, uva, AllocFlags::ZERO);

        // Bind the insert result first: holding the SPT guard into the
        // error arm would request the frame lock with the SPT lock held.
        let inserted = proc
            .spt
            .lock()
            .insert(PageEntry::anon_resident(uva, kva, frame_id));
        if let Err(e) = inserted {
            self.frame_discard(frame_id);
            return Err(e);
        }
        if !proc.pagedir.install(uva, kva, true) {
            proc.spt.lock().remove(uva);
            self.frame_discard(frame_id);
            return Err(VmError::BadAddress);
        }
        self.frames.lock().unpin(frame_id);
        log::debug!("vm: stack page pid={} uva={:#x}", proc.pid, uva);
        Ok(())
    }

    /// Mark the descriptor resident and let the frame become evictable.
    fn commit_resident(&self, proc: &Arc<ProcessVm>, uva: Uva, kva: Kva, frame_id: FrameId) {
        proc.spt
            .lock()
            .get_mut(uva)
            .expect("descriptor vanished while loading")
            .mark_resident(kva, frame_id);
        self.frames.lock().unpin(frame_id);
    }

    /// Produce a frame for `(proc, uva)`, evicting if the pool is empty.
    /// The new entry stays pinned until the caller commits its contents.
    fn frame_alloc(&self, proc: &Arc<ProcessVm>, uva: Uva, flags: AllocFlags) -> (FrameId, Kva) {
        let mut frames = self.frames.lock();
        let kva = match self.pool.alloc(flags) {
            Some(kva) => kva,
            None => {
                self.evict_one(&mut frames);
                self.pool
                    .alloc(flags)
                    .expect("frame allocator still empty after eviction")
            }
        };
        let id = frames.insert(uva, kva, proc.clone());
        (id, kva)
    }

    /// Undo an allocation whose contents never committed.
    fn frame_discard(&self, frame_id: FrameId) {
        let mut frames = self.frames.lock();
        let fte = frames.remove(frame_id);
        self.pool.free(fte.kva);
    }

    /// Push one victim out and return its frame to the pool. Runs under the
    /// frame lock; takes the victim's SPT lock and, depending on the
    /// victim's kind, the swap lock or the backing file.
    fn evict_one(&self, frames: &mut FrameTable) {
        let victim = frames.pick_victim();
        let fte = frames.remove(victim);
        let owner = &fte.owner;

        let mut spt = owner.spt.lock();
        let entry = spt
            .get_mut(fte.uva)
            .expect("victim frame has no descriptor");
        assert!(
            entry.resident && entry.frame == Some(victim),
            "frame table and descriptor disagree on the victim"
        );

        let dirty = owner.pagedir.dirty(fte.uva);
        // Unmap before copying out, so the owner faults instead of racing
        // the copy.
        owner.pagedir.clear(fte.uva);

        match entry.kind {
            // Anonymous contents exist nowhere else: always to swap.
            PageKind::Swap => {
                let slot = self.swap.lock().swap_out(fte.kva);
                entry.mark_swapped_out(slot);
            }
            // A written-to executable page can no longer be re-read from
            // the image; it is anonymous from here on.
            PageKind::Exec if entry.writable && dirty => {
                let slot = self.swap.lock().swap_out(fte.kva);
                entry.mark_swapped_out(slot);
            }
            PageKind::Exec => entry.mark_discarded(),
            PageKind::MmFile => {
                if dirty {
                    let file = entry.file.as_ref().expect("mapped-file page without a file");
                    write_back(file, fte.kva, entry.read_bytes, entry.ofs);
                }
                entry.mark_discarded();
            }
        }
        drop(spt);

        self.pool.free(fte.kva);
        frames.note_eviction();
        log::debug!(
            "vm: evicted pid={} uva={:#x} kva={:#x}",
            fte.owner.pid,
            fte.uva,
            fte.kva
        );
    }

    /// Shared by mmap, exec load and the mmap path of teardown: one
    /// descriptor per page, refusing the whole request up front so a
    /// partial overlap cannot leave strays behind.
    #[allow(clippy::too_many_arguments)]
    fn lazy_map(
        &self,
        pid: Pid,
        file: &Arc<dyn BackingFile>,
        ofs: u64,
        base_uva: Uva,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
        kind: PageKind,
    ) -> Result<(), VmError> {
        assert!(
            is_page_aligned(base_uva) && is_page_aligned(ofs),
            "segment inputs must be page-aligned"
        );
        assert!(
            (read_bytes + zero_bytes) % PAGE_SIZE == 0,
            "segment span must be whole pages"
        );

        let proc = self.process(pid);
        let pages = (read_bytes + zero_bytes) / PAGE_SIZE;
        let mut spt = proc.spt.lock();

        for i in 0..pages {
            if spt.contains(base_uva + (i * PAGE_SIZE) as u64) {
                return Err(VmError::Overlap);
            }
        }

        let mut uva = base_uva;
        let mut ofs = ofs;
        let mut remaining = read_bytes;
        for _ in 0..pages {
            let page_read = remaining.min(PAGE_SIZE);
            let entry = match kind {
                PageKind::Exec => PageEntry::exec(file.clone(), ofs, uva, page_read, writable),
                PageKind::MmFile => PageEntry::mmfile(file.clone(), ofs, uva, page_read, writable),
                PageKind::Swap => unreachable!("anonymous pages are not lazily mapped"),
            };
            spt.insert(entry).expect("page covered despite overlap check");
            uva += PAGE_SIZE as u64;
            ofs += page_read as u64;
            remaining -= page_read;
        }
        Ok(())
    }

    /// Destroy the descriptors covering `pages` pages from `base`, writing
    /// dirty mapped-file pages back and releasing frames and swap slots.
    fn unmap_range(&self, proc: &Arc<ProcessVm>, base: Uva, pages: usize) {
        let mut frames = self.frames.lock();
        let mut spt = proc.spt.lock();
        for i in 0..pages {
            let uva = base + (i * PAGE_SIZE) as u64;
            let entry = spt.remove(uva).expect("mapping page without a descriptor");
            self.drop_entry(&mut frames, proc, entry);
        }
    }

    /// Release whatever a descriptor still holds: its frame (after a dirty
    /// mapped-file write-back) or its swap slot.
    fn drop_entry(&self, frames: &mut FrameTable, proc: &ProcessVm, entry: PageEntry) {
        if entry.resident {
            let kva = entry.kva.expect("resident page without a frame address");
            let frame_id = entry.frame.expect("resident page without a frame");
            if entry.kind == PageKind::MmFile && proc.pagedir.dirty(entry.uva) {
                let file = entry.file.as_ref().expect("mapped-file page without a file");
                write_back(file, kva, entry.read_bytes, entry.ofs);
            }
            proc.pagedir.clear(entry.uva);
            frames.remove(frame_id);
            self.pool.free(kva);
        } else if entry.kind == PageKind::Swap {
            let slot = entry.swap_slot.expect("anonymous page with no swap slot");
            self.swap.lock().release(slot);
        }
    }
}

/// Write a page's live bytes back to its file. Losing data here is not an
/// option: a short write is a bug in the backing store, not a condition the
/// core can recover from.
fn write_back(file: &Arc<dyn BackingFile>, kva: Kva, read_bytes: usize, ofs: u64) {
    let page = unsafe { frame_bytes(kva) };
    let written = file.write_at(&page[..read_bytes], ofs);
    assert_eq!(written, read_bytes, "mapped-file write-back lost data");
}

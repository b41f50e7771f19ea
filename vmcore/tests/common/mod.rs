//! In-memory collaborators for driving the core in a host process: a page
//! directory that models the accessed/dirty bits, a RAM block device, a
//! RAM-backed file and a frame pool of boxed pages.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use vmcore::hal::{AllocFlags, BackingFile, BlockDevice, FramePool, PageDirectory};
use vmcore::{page_round_down, Kva, Pid, Uva, VmCore, PAGE_SIZE};

/// Stack pointer used by the tests, a little below the top of user space.
pub const SP: u64 = 0x7fff_ffff_0000;

struct Mapping {
    kva: Kva,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// Software model of one process's page directory.
pub struct TestPageDir {
    pages: Mutex<BTreeMap<Uva, Mapping>>,
}

impl TestPageDir {
    pub fn new() -> Arc<Self> {
        Arc::new(TestPageDir {
            pages: Mutex::new(BTreeMap::new()),
        })
    }

    /// What the MMU would do on a load/store through a mapped page.
    pub fn hw_touch(&self, uva: Uva, write: bool) {
        let mut pages = self.pages.lock().unwrap();
        let mapping = pages.get_mut(&uva).expect("touch through unmapped page");
        mapping.accessed = true;
        if write {
            assert!(mapping.writable, "store through read-only mapping");
            mapping.dirty = true;
        }
    }

    pub fn mapping_count(&self) -> usize {
        self.pages.lock().unwrap().len()
    }
}

impl PageDirectory for TestPageDir {
    fn install(&self, uva: Uva, kva: Kva, writable: bool) -> bool {
        let mut pages = self.pages.lock().unwrap();
        if pages.contains_key(&uva) {
            return false;
        }
        pages.insert(
            uva,
            Mapping {
                kva,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    fn clear(&self, uva: Uva) {
        self.pages.lock().unwrap().remove(&uva);
    }

    fn translate(&self, uva: Uva) -> Option<Kva> {
        self.pages.lock().unwrap().get(&uva).map(|m| m.kva)
    }

    fn accessed(&self, uva: Uva) -> bool {
        self.pages
            .lock()
            .unwrap()
            .get(&uva)
            .map(|m| m.accessed)
            .unwrap_or(false)
    }

    fn dirty(&self, uva: Uva) -> bool {
        self.pages
            .lock()
            .unwrap()
            .get(&uva)
            .map(|m| m.dirty)
            .unwrap_or(false)
    }

    fn set_accessed(&self, uva: Uva, accessed: bool) {
        if let Some(m) = self.pages.lock().unwrap().get_mut(&uva) {
            m.accessed = accessed;
        }
    }
}

pub struct RamDisk {
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(sectors: u64) -> Arc<Self> {
        Arc::new(RamDisk {
            data: Mutex::new(vec![0; sectors as usize * 512]),
        })
    }
}

impl BlockDevice for RamDisk {
    fn sector_size(&self) -> usize {
        512
    }

    fn sector_count(&self) -> u64 {
        (self.data.lock().unwrap().len() / 512) as u64
    }

    fn read(&self, sector: u64, buf: &mut [u8]) {
        let data = self.data.lock().unwrap();
        let lo = sector as usize * 512;
        buf.copy_from_slice(&data[lo..lo + buf.len()]);
    }

    fn write(&self, sector: u64, buf: &[u8]) {
        let mut data = self.data.lock().unwrap();
        let lo = sector as usize * 512;
        data[lo..lo + buf.len()].copy_from_slice(buf);
    }
}

/// RAM-backed file of fixed length; `reopen` clones share the contents, the
/// way two handles onto one inode do.
pub struct RamFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl RamFile {
    pub fn new(contents: &[u8]) -> Arc<Self> {
        Arc::new(RamFile {
            data: Arc::new(Mutex::new(contents.to_vec())),
        })
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl BackingFile for RamFile {
    fn read_at(&self, buf: &mut [u8], ofs: u64) -> usize {
        let data = self.data.lock().unwrap();
        let ofs = ofs as usize;
        if ofs >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - ofs);
        buf[..n].copy_from_slice(&data[ofs..ofs + n]);
        n
    }

    fn write_at(&self, buf: &[u8], ofs: u64) -> usize {
        let mut data = self.data.lock().unwrap();
        let ofs = ofs as usize;
        if ofs >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - ofs);
        data[ofs..ofs + n].copy_from_slice(&buf[..n]);
        n
    }

    fn length(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn reopen(&self) -> Arc<dyn BackingFile> {
        Arc::new(RamFile {
            data: self.data.clone(),
        })
    }
}

/// Readable file whose writes always fail; for exercising the write-back
/// loss assertion.
pub struct WriteProofFile {
    data: Vec<u8>,
}

impl WriteProofFile {
    pub fn new(contents: &[u8]) -> Arc<Self> {
        Arc::new(WriteProofFile {
            data: contents.to_vec(),
        })
    }
}

impl BackingFile for WriteProofFile {
    fn read_at(&self, buf: &mut [u8], ofs: u64) -> usize {
        let ofs = ofs as usize;
        if ofs >= self.data.len() {
            return 0;
        }
        let n = buf.len().min(self.data.len() - ofs);
        buf[..n].copy_from_slice(&self.data[ofs..ofs + n]);
        n
    }

    fn write_at(&self, _buf: &[u8], _ofs: u64) -> usize {
        0
    }

    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn reopen(&self) -> Arc<dyn BackingFile> {
        Arc::new(WriteProofFile {
            data: self.data.clone(),
        })
    }
}

struct PoolState {
    free: Vec<Kva>,
    in_use: usize,
    // Keeps the page allocations alive; box payloads never move.
    backing: Vec<Box<[u8; PAGE_SIZE]>>,
}

/// Fixed-size pool of page frames.
pub struct TestPool {
    state: Mutex<PoolState>,
}

impl TestPool {
    pub fn new(frames: usize) -> Arc<Self> {
        let mut backing = Vec::with_capacity(frames);
        let mut free = Vec::with_capacity(frames);
        for _ in 0..frames {
            let mut page = Box::new([0u8; PAGE_SIZE]);
            free.push(page.as_mut_ptr() as Kva);
            backing.push(page);
        }
        Arc::new(TestPool {
            state: Mutex::new(PoolState {
                free,
                in_use: 0,
                backing,
            }),
        })
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().unwrap().in_use
    }
}

impl FramePool for TestPool {
    fn alloc(&self, flags: AllocFlags) -> Option<Kva> {
        let mut state = self.state.lock().unwrap();
        let kva = state.free.pop()?;
        state.in_use += 1;
        if flags.contains(AllocFlags::ZERO) {
            unsafe { std::ptr::write_bytes(kva as *mut u8, 0, PAGE_SIZE) };
        }
        Some(kva)
    }

    fn free(&self, kva: Kva) {
        let mut state = self.state.lock().unwrap();
        state.in_use -= 1;
        state.free.push(kva);
    }
}

/// A core with `frames` physical frames, a swap device of `swap_sectors`
/// 512-byte sectors, and process 1 attached.
pub fn setup(frames: usize, swap_sectors: u64) -> (VmCore, Arc<TestPageDir>, Arc<TestPool>) {
    let pool = TestPool::new(frames);
    let vm = VmCore::new(RamDisk::new(swap_sectors), pool.clone());
    let dir = TestPageDir::new();
    vm.attach_process(1, dir.clone());
    (vm, dir, pool)
}

/// Read one user byte the way a user load would: fault if unmapped, then
/// touch through the mapping.
pub fn read_user(vm: &VmCore, dir: &TestPageDir, pid: Pid, va: u64, sp: u64) -> u8 {
    if vm.translate(pid, va).is_none() {
        vm.handle_fault(pid, va, sp, true, false)
            .expect("read fault unresolved");
    }
    let kva = vm.translate(pid, va).expect("page not mapped after fault");
    dir.hw_touch(page_round_down(va), false);
    unsafe { *(kva as *const u8) }
}

/// Store one user byte, faulting the page in if needed.
pub fn write_user(vm: &VmCore, dir: &TestPageDir, pid: Pid, va: u64, byte: u8, sp: u64) {
    if vm.translate(pid, va).is_none() {
        vm.handle_fault(pid, va, sp, true, true)
            .expect("write fault unresolved");
    }
    let kva = vm.translate(pid, va).expect("page not mapped after fault");
    dir.hw_touch(page_round_down(va), true);
    unsafe { *(kva as *mut u8) = byte };
}

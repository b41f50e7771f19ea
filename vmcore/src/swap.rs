//! Swap store.
//!
//! Serializes anonymous pages to a block device, one page per slot, with a
//! slot-occupancy bitmap. Slots are consumed on restore: a page's contents
//! live in swap at most once. The store is driven under a single lock held
//! by [`crate::VmCore`], which covers the bitmap update and the sector loop
//! of one page, so concurrent evictions can never interleave their sector
//! writes to the same slot.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::hal::{frame_bytes, frame_bytes_mut, BlockDevice};
use crate::{Kva, PAGE_SIZE};

/// Index of a swap slot.
pub type SwapSlot = u32;

pub struct SwapStore {
    device: Arc<dyn BlockDevice>,
    /// One flag per slot: true = in use.
    slots: Vec<bool>,
    used: usize,
    sectors_per_page: u64,
    pages_out: u64,
    pages_in: u64,
}

impl SwapStore {
    /// Size the slot bitmap from the device geometry. The whole device is
    /// scratch; nothing persists across boots.
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let sector_size = device.sector_size();
        assert!(
            sector_size > 0 && PAGE_SIZE % sector_size == 0,
            "sector size must divide the page size"
        );
        let sectors_per_page = (PAGE_SIZE / sector_size) as u64;
        let slot_count = (device.sector_count() / sectors_per_page) as usize;
        log::info!(
            "swap: {} slots ({} KB) on {}-byte sectors",
            slot_count,
            slot_count * PAGE_SIZE / 1024,
            sector_size
        );
        SwapStore {
            device,
            slots: vec![false; slot_count],
            used: 0,
            sectors_per_page,
            pages_out: 0,
            pages_in: 0,
        }
    }

    /// Write the page at `kva` to the first free slot and return its index.
    ///
    /// Swap exhaustion is unrecoverable here: an anonymous page with no slot
    /// has nowhere to live, so the core gives up rather than lose it.
    pub fn swap_out(&mut self, kva: Kva) -> SwapSlot {
        let idx = self
            .slots
            .iter()
            .position(|in_use| !in_use)
            .expect("swap device full");
        self.slots[idx] = true;
        self.used += 1;

        let page = unsafe { frame_bytes(kva) };
        let sector_size = self.device.sector_size();
        let base = idx as u64 * self.sectors_per_page;
        for i in 0..self.sectors_per_page {
            let lo = i as usize * sector_size;
            self.device.write(base + i, &page[lo..lo + sector_size]);
        }
        self.pages_out += 1;
        log::debug!("swap: out kva={:#x} -> slot {}", kva, idx);
        idx as SwapSlot
    }

    /// Read `slot` into the page at `kva` and free the slot.
    pub fn swap_in(&mut self, kva: Kva, slot: SwapSlot) {
        let idx = slot as usize;
        assert!(self.slots[idx], "swap-in from a free slot");

        let page = unsafe { frame_bytes_mut(kva) };
        let sector_size = self.device.sector_size();
        let base = slot as u64 * self.sectors_per_page;
        for i in 0..self.sectors_per_page {
            let lo = i as usize * sector_size;
            self.device.read(base + i, &mut page[lo..lo + sector_size]);
        }
        self.slots[idx] = false;
        self.used -= 1;
        self.pages_in += 1;
        log::debug!("swap: in slot {} -> kva={:#x}", slot, kva);
    }

    /// Free a slot without reading it (exit path of the owning process).
    pub fn release(&mut self, slot: SwapSlot) {
        let idx = slot as usize;
        assert!(self.slots[idx], "releasing a free slot");
        self.slots[idx] = false;
        self.used -= 1;
    }

    pub fn slots_used(&self) -> usize {
        self.used
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn pages_out(&self) -> u64 {
        self.pages_out
    }

    pub fn pages_in(&self) -> u64 {
        self.pages_in
    }

    /// Whether `slot` is currently occupied.
    pub fn slot_in_use(&self, slot: SwapSlot) -> bool {
        self.slots.get(slot as usize).copied().unwrap_or(false)
    }
}

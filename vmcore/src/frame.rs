//! Frame table.
//!
//! Process-agnostic registry of resident user frames and owner of the
//! eviction policy. Entries live in an arena keyed by a monotonically
//! issued id, so iterating the map in key order is iteration in insertion
//! order and descriptors can refer to their frame by a stable id instead of
//! a pointer. The table itself is pure bookkeeping; [`crate::VmCore`]
//! drives it under the frame lock and performs the actual swap and file
//! I/O an eviction triggers.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::vm::ProcessVm;
use crate::{Kva, Pid, Uva};

/// Stable identity of a frame-table entry.
pub type FrameId = u64;

/// One resident user frame.
pub struct Fte {
    pub uva: Uva,
    pub kva: Kva,
    pub owner: Arc<ProcessVm>,
    /// Excluded from victim scans while its contents are in flight (being
    /// filled on the fault path, or being written out on teardown).
    pub pinned: bool,
}

pub struct FrameTable {
    entries: BTreeMap<FrameId, Fte>,
    next_id: FrameId,
    evictions: u64,
}

impl FrameTable {
    pub fn new() -> Self {
        FrameTable {
            entries: BTreeMap::new(),
            next_id: 0,
            evictions: 0,
        }
    }

    /// Register a frame for `owner`, pinned until its first contents are
    /// committed. Returns the entry's stable id.
    pub fn insert(&mut self, uva: Uva, kva: Kva, owner: Arc<ProcessVm>) -> FrameId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Fte {
                uva,
                kva,
                owner,
                pinned: true,
            },
        );
        id
    }

    pub fn unpin(&mut self, id: FrameId) {
        if let Some(fte) = self.entries.get_mut(&id) {
            fte.pinned = false;
        }
    }

    pub fn remove(&mut self, id: FrameId) -> Fte {
        self.entries.remove(&id).expect("frame id not in table")
    }

    pub fn get(&self, id: FrameId) -> Option<&Fte> {
        self.entries.get(&id)
    }

    /// Entry backing `uva` in process `pid`, if resident.
    pub fn find(&self, pid: Pid, uva: Uva) -> Option<FrameId> {
        self.entries
            .iter()
            .find(|(_, fte)| fte.owner.pid == pid && fte.uva == uva)
            .map(|(&id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FrameId, &Fte)> {
        self.entries.iter().map(|(&id, fte)| (id, fte))
    }

    pub fn note_eviction(&mut self) {
        self.evictions += 1;
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Pick an eviction victim by a four-class clock scan.
    ///
    /// Frames are ranked by their (accessed, dirty) bits, best victim
    /// first: (0,0), (0,1), (1,0), (1,1). The first pass takes the first
    /// (0,0) frame in insertion order and clears the accessed bit on every
    /// frame it walks past; each later pass widens the acceptable classes
    /// by one step. Because the first pass left every scanned frame with
    /// A=0, the second pass already accepts every frame that was not
    /// re-accessed in between, so the scan finds a victim within two
    /// passes. Failing all four passes means there was nothing to scan.
    pub fn pick_victim(&self) -> FrameId {
        for (&id, fte) in &self.entries {
            if fte.pinned {
                continue;
            }
            let pd = &fte.owner.pagedir;
            let accessed = pd.accessed(fte.uva);
            if !accessed && !pd.dirty(fte.uva) {
                return id;
            }
            if accessed {
                pd.set_accessed(fte.uva, false);
            }
        }

        for widest in 1..=3u8 {
            for (&id, fte) in &self.entries {
                if fte.pinned {
                    continue;
                }
                let pd = &fte.owner.pagedir;
                let class = (pd.accessed(fte.uva) as u8) * 2 + pd.dirty(fte.uva) as u8;
                if class <= widest {
                    return id;
                }
            }
        }

        panic!("no evictable frame");
    }
}

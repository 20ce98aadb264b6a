// Per-process Address Space
//
// Everything the VM core knows about one user process: its page directory,
// the index of its supplemental page table, and the memory mappings it has
// established. Address spaces are owned by the `VmManager` and only touched
// under the VM lock; the eviction path of one process reaches into the
// address space of another through here.
//
// Lifecycle:
// - Created by `VmManager::register_process` before any segment is loaded
// - Removed by `VmManager::release_all` once every page and frame it owned
//   has been torn down

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use x86_64::VirtAddr;

use crate::mm::file::FileHandle;
use crate::mm::pagedir::PageDirectory;
use crate::mm::spt::Spt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    pub const fn from_raw(value: u64) -> Self {
        ProcessId(value)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Identifies one memory mapping within its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(u32);

impl MapId {
    pub const fn from_raw(value: u32) -> Self {
        MapId(value)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Map({})", self.0)
    }
}

/// A file mapped at `start` over `page_count` contiguous pages. Owns the
/// reopened file handle until the mapping is torn down.
#[derive(Clone)]
pub struct Mapping {
    pub id: MapId,
    pub start: VirtAddr,
    pub page_count: u64,
    pub file: FileHandle,
}

pub struct AddressSpace {
    pid: ProcessId,
    pub(crate) dir: Arc<dyn PageDirectory>,
    pub(crate) spt: Spt,
    pub(crate) mappings: BTreeMap<MapId, Mapping>,
    next_map_id: u32,
}

impl AddressSpace {
    pub fn new(pid: ProcessId, dir: Arc<dyn PageDirectory>) -> Self {
        Self {
            pid,
            dir,
            spt: Spt::new(),
            mappings: BTreeMap::new(),
            next_map_id: 1,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn page_count(&self) -> usize {
        self.spt.len()
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    pub(crate) fn allocate_map_id(&mut self) -> MapId {
        let id = MapId(self.next_map_id);
        self.next_map_id = self.next_map_id.wrapping_add(1).max(1);
        id
    }
}

// Supplemental Page Table
//
// Per-process record of how every non-trivial user page is backed, whether
// or not it is currently resident. The hardware page table only knows about
// resident pages; this table is what lets a fault on an absent page be told
// apart from a wild access.
//
// Core abstractions:
// - `Backing`: where a page's initial contents come from (executable file,
//   zero-filled stack, memory-mapped file); only the variant's own fields exist
// - `Residency`: exactly one of never-loaded, resident in a frame, or in a
//   swap slot; a page can never be both mapped and swapped
// - `SptArena`: owns all entries system-wide behind generation-checked
//   handles, so a frame-table entry can refer to its page without a raw
//   back-pointer and a stale handle is detected instead of dereferenced
// - `Spt`: the per-process index from page address to handle
//
// Entry lifecycle (create / lookup / destroy) is implemented on `VmState`
// below, because destroying a resident page also touches the frame table,
// the page directory and the swap store.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::config::PAGE_SIZE;
use crate::mm::addrspace::{MapId, ProcessId};
use crate::mm::file::FileHandle;
use crate::mm::pmm::Frame;
use crate::mm::swap::SwapSlot;
use crate::mm::vm::{Devices, VmState};
use crate::mm::VmError;
use crate::log_debug;

const LOG_ORIGIN: &str = "spt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    FileBacked,
    Stack,
    MemoryMapped,
}

#[derive(Clone)]
pub enum Backing {
    File {
        file: FileHandle,
        offset: u64,
        length: usize,
    },
    Stack,
    Mapped {
        map: MapId,
        file: FileHandle,
        offset: u64,
        length: usize,
    },
}

impl Backing {
    pub fn kind(&self) -> PageKind {
        match self {
            Backing::File { .. } => PageKind::FileBacked,
            Backing::Stack => PageKind::Stack,
            Backing::Mapped { .. } => PageKind::MemoryMapped,
        }
    }

    /// File, offset and byte count to read when the page is first faulted in.
    pub fn file_source(&self) -> Option<(&FileHandle, u64, usize)> {
        match self {
            Backing::File { file, offset, length } | Backing::Mapped { file, offset, length, .. } => {
                Some((file, *offset, *length))
            }
            Backing::Stack => None,
        }
    }

    pub fn length(&self) -> usize {
        self.file_source().map_or(0, |(_, _, length)| length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Unloaded,
    Resident(Frame),
    Swapped(SwapSlot),
}

pub struct SptEntry {
    upage: VirtAddr,
    owner: ProcessId,
    pub(crate) backing: Backing,
    pub(crate) writable: bool,
    pub(crate) residency: Residency,
}

impl SptEntry {
    pub fn new(upage: VirtAddr, owner: ProcessId, backing: Backing, writable: bool) -> Self {
        Self {
            upage,
            owner,
            backing,
            writable,
            residency: Residency::Unloaded,
        }
    }

    pub fn upage(&self) -> VirtAddr {
        self.upage
    }

    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    pub fn kind(&self) -> PageKind {
        self.backing.kind()
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn is_swapped(&self) -> bool {
        matches!(self.residency, Residency::Swapped(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SptHandle {
    index: u32,
    generation: u32,
}

struct ArenaSlot {
    generation: u32,
    entry: Option<SptEntry>,
}

pub struct SptArena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
    live: usize,
}

impl SptArena {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn insert(&mut self, entry: SptEntry) -> SptHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return SptHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(ArenaSlot {
            generation: 0,
            entry: Some(entry),
        });
        SptHandle { index, generation: 0 }
    }

    pub fn get(&self, handle: SptHandle) -> Option<&SptEntry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn get_mut(&mut self, handle: SptHandle) -> Option<&mut SptEntry> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub fn remove(&mut self, handle: SptHandle) -> Option<SptEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn iter(&self) -> impl Iterator<Item = (SptHandle, &SptEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    SptHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }
}

impl Default for SptArena {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct Spt {
    pages: BTreeMap<VirtAddr, SptHandle>,
}

impl Spt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, upage: VirtAddr) -> Option<SptHandle> {
        self.pages.get(&upage).copied()
    }

    pub fn insert(&mut self, upage: VirtAddr, handle: SptHandle) {
        self.pages.insert(upage, handle);
    }

    pub fn remove(&mut self, upage: VirtAddr) -> Option<SptHandle> {
        self.pages.remove(&upage)
    }

    pub fn pages(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        self.pages.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Bytes of a dirty memory-mapped page that must reach its file once the
/// VM lock has been dropped.
pub struct WriteBack {
    pub file: FileHandle,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl VmState {
    pub(crate) fn spt_lookup(&self, pid: ProcessId, upage: VirtAddr) -> Option<SptHandle> {
        self.spaces.get(&pid)?.spt.lookup(upage)
    }

    /// Registers a new entry for `upage`. The caller has checked that no entry
    /// exists yet.
    pub(crate) fn spt_create(
        &mut self,
        pid: ProcessId,
        upage: VirtAddr,
        backing: Backing,
        writable: bool,
    ) -> Result<SptHandle, VmError> {
        let space = self.spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess)?;
        if space.spt.lookup(upage).is_some() {
            return Err(VmError::AlreadyMapped);
        }

        let handle = self.entries.insert(SptEntry::new(upage, pid, backing, writable));
        space.spt.insert(upage, handle);
        Ok(handle)
    }

    /// Removes the entry for `upage` and everything it holds: its frame and
    /// translation if resident, its swap slot if swapped. For a dirty
    /// memory-mapped page the bytes to write back are returned, since the
    /// file system cannot be entered under the VM lock.
    pub(crate) fn spt_destroy(
        &mut self,
        pid: ProcessId,
        upage: VirtAddr,
        dev: &Devices<'_>,
    ) -> Option<WriteBack> {
        let space = self.spaces.get_mut(&pid)?;
        let handle = space.spt.remove(upage)?;
        let dir = space.dir.clone();
        let entry = self.entries.remove(handle)?;

        let write_back = match entry.residency {
            Residency::Resident(frame) => {
                let dirty = dir.is_dirty(upage);
                dir.clear(upage);

                let write_back = match &entry.backing {
                    Backing::Mapped { file, offset, length, .. } if dirty => Some(WriteBack {
                        file: file.clone(),
                        offset: *offset,
                        data: dev.pool.contents(frame)[..*length].to_vec(),
                    }),
                    _ => None,
                };

                self.free_frame(frame, dev);
                write_back
            }
            Residency::Swapped(slot) => {
                // Only dirty pages are ever swapped, so a swapped mapped page
                // always differs from its file.
                let write_back = match &entry.backing {
                    Backing::Mapped { file, offset, length, .. } => {
                        let mut page = Box::new([0u8; PAGE_SIZE]);
                        dev.swap.read_in(slot, &mut page);
                        Some(WriteBack {
                            file: file.clone(),
                            offset: *offset,
                            data: page[..*length].to_vec(),
                        })
                    }
                    _ => None,
                };
                dev.swap.release(slot);
                write_back
            }
            Residency::Unloaded => None,
        };

        log_debug!(
            LOG_ORIGIN,
            "Destroyed {:?} page {:#x} of {} (write-back: {})",
            entry.kind(),
            upage.as_u64(),
            pid,
            write_back.is_some()
        );

        write_back
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: u64) -> SptEntry {
        SptEntry::new(
            VirtAddr::new(addr),
            ProcessId::from_raw(1),
            Backing::Stack,
            true,
        )
    }

    #[test]
    fn stale_handle_is_rejected_after_slot_reuse() {
        let mut arena = SptArena::new();
        let first = arena.insert(entry(0x1000));
        assert!(arena.remove(first).is_some());

        let second = arena.insert(entry(0x2000));
        assert!(arena.get(first).is_none());
        assert!(arena.remove(first).is_none());
        assert_eq!(arena.get(second).unwrap().upage(), VirtAddr::new(0x2000));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn new_entry_has_never_been_loaded() {
        let e = entry(0x3000);
        assert_eq!(e.residency(), Residency::Unloaded);
        assert!(!e.is_swapped());
        assert_eq!(e.kind(), PageKind::Stack);
        assert_eq!(e.backing.length(), 0);
    }

    #[test]
    fn index_iterates_in_address_order() {
        let mut arena = SptArena::new();
        let mut spt = Spt::new();
        for addr in [0x5000u64, 0x1000, 0x3000] {
            let h = arena.insert(entry(addr));
            spt.insert(VirtAddr::new(addr), h);
        }
        let pages: Vec<u64> = spt.pages().map(|p| p.as_u64()).collect();
        assert_eq!(pages, [0x1000, 0x3000, 0x5000]);
        assert_eq!(arena.iter().count(), 3);
    }
}

// Frame Table & Eviction
//
// System-wide map from every frame holding a user page to the page that
// occupies it. When the user pool runs dry, the frame table picks a victim
// with the second-chance (clock) algorithm and reclaims it.
//
// Key responsibilities:
// - Hand out a frame for a page, evicting one if the pool is empty
// - Bind a frame to its page in the owner's page directory
// - Keep frames pinned while they are being filled so the clock skips them
// - Push evicted pages to swap when they cannot be rebuilt from a file
//
// Clock details:
// - The cursor is a field of the table, not hidden iterator state; it names
//   the last frame examined and survives removals because the next step is
//   "first frame strictly after the cursor", wrapping to the lowest frame
// - Accessed and unpinned: clear the accessed bit and move on
// - Not accessed and unpinned: victim
// - Pinned: skipped whatever its accessed bit says
// - Two full sweeps without a victim means every frame is pinned. If some
//   of those pins belong to file loads in flight, the allocation backs off
//   and the caller retries once the VM lock has been dropped; otherwise the
//   pins are permanent and that is a fatal configuration error
//
// Victim handling:
// - The translation is cleared first so the owner cannot write while the
//   contents are being copied out
// - Dirty pages and stack pages go to a fresh swap slot; clean file-derived
//   pages are dropped and will be re-read on the next fault
// - A full swap store halts the kernel
//
// All of this runs under the VM lock.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::Bound;
use core::sync::atomic::Ordering;
use x86_64::VirtAddr;

use crate::config::PAGE_SIZE;
use crate::mm::addrspace::{AddressSpace, ProcessId};
use crate::mm::halt;
use crate::mm::pmm::Frame;
use crate::mm::spt::{PageKind, Residency, SptHandle};
use crate::mm::vm::{Devices, VmState};
use crate::log_debug;

const LOG_ORIGIN: &str = "frame";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    pub owner: ProcessId,
    pub frame: Frame,
    pub upage: VirtAddr,
    pub spte: SptHandle,
    pub pinned: bool,
}

pub struct FrameTable {
    entries: BTreeMap<Frame, FrameEntry>,
    cursor: Option<Frame>,
}

impl FrameTable {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            cursor: None,
        }
    }

    /// Records `entry`. Returns false if its frame is already in the table.
    pub fn insert(&mut self, entry: FrameEntry) -> bool {
        if self.entries.contains_key(&entry.frame) {
            return false;
        }
        self.entries.insert(entry.frame, entry);
        true
    }

    pub fn remove(&mut self, frame: Frame) -> Option<FrameEntry> {
        self.entries.remove(&frame)
    }

    pub fn get(&self, frame: Frame) -> Option<&FrameEntry> {
        self.entries.get(&frame)
    }

    pub fn set_pinned(&mut self, frame: Frame, pinned: bool) -> bool {
        match self.entries.get_mut(&frame) {
            Some(entry) => {
                entry.pinned = pinned;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> Option<Frame> {
        self.cursor
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameEntry> {
        self.entries.values()
    }

    pub fn owned_by(&self, owner: ProcessId) -> Vec<Frame> {
        self.entries
            .values()
            .filter(|entry| entry.owner == owner)
            .map(|entry| entry.frame)
            .collect()
    }

    fn advance(&mut self) -> Option<Frame> {
        let next = match self.cursor {
            Some(cursor) => self
                .entries
                .range((Bound::Excluded(cursor), Bound::Unbounded))
                .next()
                .or_else(|| self.entries.iter().next()),
            None => self.entries.iter().next(),
        }
        .map(|(frame, _)| *frame)?;

        self.cursor = Some(next);
        Some(next)
    }

    /// Runs the clock until it finds an unpinned frame whose accessed bit is
    /// clear, consuming second chances on the way.
    pub fn select_victim(&mut self, spaces: &BTreeMap<ProcessId, AddressSpace>) -> Option<Frame> {
        let limit = 2 * self.entries.len() + 1;

        for _ in 0..limit {
            let frame = self.advance()?;
            let entry = self.entries[&frame];
            if entry.pinned {
                continue;
            }

            let Some(space) = spaces.get(&entry.owner) else {
                return Some(frame);
            };

            if space.dir.is_accessed(entry.upage) {
                space.dir.set_accessed(entry.upage, false);
                continue;
            }

            return Some(frame);
        }

        None
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VmState {
    /// Returns a frame for `spte` and records it pinned. If the pool is
    /// empty a resident page is evicted. `None` means every frame is pinned
    /// by a load still in flight: nothing has changed and the caller must
    /// drop the VM lock before trying again.
    pub(crate) fn reserve_frame(
        &mut self,
        owner: ProcessId,
        upage: VirtAddr,
        spte: SptHandle,
        dev: &Devices<'_>,
    ) -> Option<Frame> {
        let frame = match dev.pool.alloc_frame() {
            Some(frame) => frame,
            None => self.evict_frame(dev)?,
        };

        let fresh = self.frames.insert(FrameEntry {
            owner,
            frame,
            upage,
            spte,
            pinned: true,
        });
        debug_assert!(fresh, "{} handed out twice", frame);
        Some(frame)
    }

    fn evict_frame(&mut self, dev: &Devices<'_>) -> Option<Frame> {
        let Some(frame) = self.frames.select_victim(&self.spaces) else {
            if self.loads_in_flight == 0 {
                halt(LOG_ORIGIN, "no evictable frame: every user frame is pinned");
            }
            dev.counters.frame_waits.fetch_add(1, Ordering::Relaxed);
            log_debug!(
                LOG_ORIGIN,
                "All frames pinned, waiting on {} loads in flight",
                self.loads_in_flight
            );
            return None;
        };

        let Some(victim) = self.frames.remove(frame) else {
            halt(LOG_ORIGIN, "clock selected a frame missing from the frame table");
        };

        let dir = self.spaces.get(&victim.owner).map(|space| space.dir.clone());
        if let Some(dir) = &dir {
            dir.clear(victim.upage);
        }
        let dirty = dir.as_ref().map_or(false, |dir| dir.is_dirty(victim.upage));

        let Some(entry) = self.entries.get_mut(victim.spte) else {
            halt(LOG_ORIGIN, "frame table references a destroyed page");
        };

        if dirty || entry.kind() == PageKind::Stack {
            let mut page = Box::new([0u8; PAGE_SIZE]);
            dev.pool.copy_out(frame, &mut page);
            let Some(slot) = dev.swap.write_out(&page) else {
                halt(LOG_ORIGIN, "swap partition is full");
            };
            entry.residency = Residency::Swapped(slot);
            dev.counters.swap_outs.fetch_add(1, Ordering::Relaxed);

            log_debug!(
                LOG_ORIGIN,
                "Evicted {:#x} of {} from {} to {}",
                victim.upage.as_u64(),
                victim.owner,
                frame,
                slot
            );
        } else {
            entry.residency = Residency::Unloaded;

            log_debug!(
                LOG_ORIGIN,
                "Evicted clean {:#x} of {} from {}",
                victim.upage.as_u64(),
                victim.owner,
                frame
            );
        }

        dev.counters.evictions.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Maps `frame` at its page in the owner's directory, with the page's
    /// write permission, and marks it recently used. The frame stays pinned.
    pub(crate) fn install_frame(&mut self, frame: Frame) -> bool {
        let Some(entry) = self.frames.get(frame).copied() else {
            return false;
        };
        let Some(writable) = self.entries.get(entry.spte).map(|spte| spte.writable) else {
            return false;
        };
        let Some(space) = self.spaces.get(&entry.owner) else {
            return false;
        };

        if !space.dir.install(entry.upage, frame, writable) {
            return false;
        }
        space.dir.set_accessed(entry.upage, true);
        true
    }

    /// Drops the frame-table entry and returns the frame to the pool. The
    /// caller has already cleared the translation and updated the page.
    pub(crate) fn free_frame(&mut self, frame: Frame, dev: &Devices<'_>) {
        self.frames.remove(frame);
        dev.pool.free_frame(frame);
    }
}

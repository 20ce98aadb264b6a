// Swap Backing Store
//
// Holds page images that are neither resident nor re-derivable from a file:
// every evicted stack page and every evicted dirty page lands here.
//
// Key responsibilities:
// - Reserve a page-sized slot and write a frame's contents into it
// - Read a slot back into a frame
// - Release slots once their page is resident again or destroyed
//
// Design notes:
// - `SwapDevice` is the narrow interface the frame table consumes; a full
//   device reports `None` from `write_out` and the caller decides whether
//   that is fatal (during eviction it is)
// - `SwapArea` implements it over any sector-addressed `BlockDevice`,
//   a page occupying `SECTORS_PER_PAGE` consecutive sectors
// - The slot bitmap lock is a leaf; device I/O happens outside it

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::mm::bitmap::Bitmap;
use crate::mm::pmm::PageBuf;
use crate::{log_debug, log_info};

const LOG_ORIGIN: &str = "swap";

pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

pub trait SwapDevice: Send + Sync {
    /// Reserves a slot and writes `page` into it; `None` when the store is full.
    fn write_out(&self, page: &PageBuf) -> Option<SwapSlot>;
    fn read_in(&self, slot: SwapSlot, page: &mut PageBuf);
    fn release(&self, slot: SwapSlot);
}

pub trait BlockDevice: Send + Sync {
    fn sector_count(&self) -> usize;
    fn read_sector(&self, sector: usize, buf: &mut [u8]);
    fn write_sector(&self, sector: usize, buf: &[u8]);
}

pub struct SwapArea<D: BlockDevice> {
    device: D,
    slots: Mutex<Bitmap>,
}

impl<D: BlockDevice> SwapArea<D> {
    pub fn new(device: D) -> Self {
        let slot_count = device.sector_count() / SECTORS_PER_PAGE;
        log_info!(
            LOG_ORIGIN,
            "Swap area ready: {} slots ({} KiB)",
            slot_count,
            slot_count * PAGE_SIZE / 1024
        );

        Self {
            device,
            slots: Mutex::new(Bitmap::new(slot_count)),
        }
    }

    pub fn free_slots(&self) -> usize {
        self.slots.lock().free_count()
    }

    pub fn in_use(&self, slot: SwapSlot) -> bool {
        self.slots.lock().is_set(slot.0)
    }

    fn first_sector(slot: SwapSlot) -> usize {
        slot.0 * SECTORS_PER_PAGE
    }
}

impl<D: BlockDevice> SwapDevice for SwapArea<D> {
    fn write_out(&self, page: &PageBuf) -> Option<SwapSlot> {
        let slot = SwapSlot(self.slots.lock().allocate()?);
        let base = Self::first_sector(slot);

        for (i, chunk) in page.chunks(SECTOR_SIZE).enumerate() {
            self.device.write_sector(base + i, chunk);
        }

        log_debug!(LOG_ORIGIN, "Wrote page to {}", slot);
        Some(slot)
    }

    fn read_in(&self, slot: SwapSlot, page: &mut PageBuf) {
        let base = Self::first_sector(slot);
        for (i, chunk) in page.chunks_mut(SECTOR_SIZE).enumerate() {
            self.device.read_sector(base + i, chunk);
        }
    }

    fn release(&self, slot: SwapSlot) {
        self.slots.lock().release(slot.0);
    }
}

/// Sector store backed by kernel heap memory.
pub struct RamDisk {
    sectors: Mutex<Vec<u8>>,
    count: usize,
}

impl RamDisk {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![0; sector_count * SECTOR_SIZE]),
            count: sector_count,
        }
    }

    pub fn with_pages(pages: usize) -> Self {
        Self::new(pages * SECTORS_PER_PAGE)
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> usize {
        self.count
    }

    fn read_sector(&self, sector: usize, buf: &mut [u8]) {
        let start = sector * SECTOR_SIZE;
        buf.copy_from_slice(&self.sectors.lock()[start..start + SECTOR_SIZE]);
    }

    fn write_sector(&self, sector: usize, buf: &[u8]) {
        let start = sector * SECTOR_SIZE;
        self.sectors.lock()[start..start + SECTOR_SIZE].copy_from_slice(buf);
    }
}

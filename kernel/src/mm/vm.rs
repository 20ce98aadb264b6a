// Virtual Memory Manager
//
// The kernel-wide owner of all demand-paging state. One `VmManager` is built
// at boot and handed to the fault path, the system-call layer and the
// process lifecycle hooks; there are no ambient globals.
//
// Key responsibilities:
// - Own the VM lock, which guards the frame table, the clock cursor, every
//   supplemental page table entry and every address space
// - Hold the shared collaborators: user frame pool, swap store, and the
//   file-system lock shared with the rest of the kernel
// - Register processes and tear them down on exit
// - Keep fault/eviction/swap counters for diagnostics
//
// Lock order:
// - The VM lock and the file-system lock are never held together. Work that
//   needs the file system (lazy loads, write-back of mapped pages) is staged
//   under the VM lock, performed after it is dropped, and committed under
//   the VM lock again; frames in flight are pinned in the meantime and
//   counted in `loads_in_flight`, so an allocation that finds every frame
//   pinned can tell a transient shortage from a permanent one
// - Frame contents, page-directory and swap-bitmap locks are leaves
//
// Process teardown:
// - Runs entirely under the VM lock, so it is atomic with respect to any
//   other process's clock sweep: the exiting process's pages are snapshotted,
//   destroyed one by one (releasing frames and slots), and any frame still
//   attributed to it is then removed before the address space goes away

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};
use x86_64::VirtAddr;

use crate::config::{page_round_down, VmConfig};
use crate::mm::addrspace::{AddressSpace, ProcessId};
use crate::mm::file::{FileHandle, FsLock};
use crate::mm::frame::FrameTable;
use crate::mm::pagedir::PageDirectory;
use crate::mm::pmm::FramePool;
use crate::mm::spt::{PageKind, Residency, SptArena, WriteBack};
use crate::mm::swap::SwapDevice;
use crate::mm::VmError;
use crate::{log_info, log_warn};

const LOG_ORIGIN: &str = "vm";

/// Everything guarded by the VM lock.
pub(crate) struct VmState {
    pub(crate) frames: FrameTable,
    pub(crate) entries: SptArena,
    pub(crate) spaces: BTreeMap<ProcessId, AddressSpace>,
    /// Pinned frames being filled from a file with the VM lock dropped.
    pub(crate) loads_in_flight: usize,
}

impl VmState {
    const fn new() -> Self {
        Self {
            frames: FrameTable::new(),
            entries: SptArena::new(),
            spaces: BTreeMap::new(),
            loads_in_flight: 0,
        }
    }
}

#[derive(Default)]
pub(crate) struct VmCounters {
    pub(crate) page_faults: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) swap_outs: AtomicU64,
    pub(crate) swap_ins: AtomicU64,
    pub(crate) frame_waits: AtomicU64,
}

/// Collaborators the locked state needs to reach while mutating.
pub(crate) struct Devices<'a> {
    pub(crate) pool: &'a FramePool,
    pub(crate) swap: &'a dyn SwapDevice,
    pub(crate) counters: &'a VmCounters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    pub page_faults: u64,
    pub evictions: u64,
    pub swap_outs: u64,
    pub swap_ins: u64,
    /// Allocations that found every frame pinned by a load and retried.
    pub frame_waits: u64,
    pub resident_frames: usize,
    pub free_frames: usize,
}

/// Snapshot of one page's SPT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub kind: PageKind,
    pub writable: bool,
    pub length: usize,
    pub residency: Residency,
    pub pinned: bool,
}

pub struct VmManager {
    state: Mutex<VmState>,
    pool: Arc<FramePool>,
    swap: Arc<dyn SwapDevice>,
    fs: Arc<FsLock>,
    config: VmConfig,
    counters: VmCounters,
}

impl VmManager {
    pub fn new(
        config: VmConfig,
        pool: Arc<FramePool>,
        swap: Arc<dyn SwapDevice>,
        fs: Arc<FsLock>,
    ) -> Self {
        let (frames, _) = pool.get_stats();
        log_info!(
            LOG_ORIGIN,
            "Virtual memory manager ready: {} user frames, user space below {:#x}, max stack {} KiB",
            frames,
            config.user_top,
            config.max_stack_size / 1024
        );

        Self {
            state: Mutex::new(VmState::new()),
            pool,
            swap,
            fs,
            config,
            counters: VmCounters::default(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn fs_lock(&self) -> &Arc<FsLock> {
        &self.fs
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, VmState> {
        self.state.lock()
    }

    pub(crate) fn devices(&self) -> Devices<'_> {
        Devices {
            pool: &self.pool,
            swap: &*self.swap,
            counters: &self.counters,
        }
    }

    pub(crate) fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub(crate) fn counters(&self) -> &VmCounters {
        &self.counters
    }

    pub fn register_process(
        &self,
        pid: ProcessId,
        dir: Arc<dyn PageDirectory>,
    ) -> Result<(), VmError> {
        let mut state = self.lock_state();
        if state.spaces.contains_key(&pid) {
            return Err(VmError::ProcessExists);
        }
        state.spaces.insert(pid, AddressSpace::new(pid, dir));
        Ok(())
    }

    pub fn is_registered(&self, pid: ProcessId) -> bool {
        self.lock_state().spaces.contains_key(&pid)
    }

    /// Tears down every page, frame, swap slot and mapping owned by `pid`.
    /// Dirty mapped pages are written back to their files.
    pub fn release_all(&self, pid: ProcessId) {
        let dev = self.devices();

        let (write_backs, files, page_count) = {
            let mut state = self.lock_state();
            let Some(space) = state.spaces.get(&pid) else {
                return;
            };

            let pages: Vec<VirtAddr> = space.spt.pages().collect();
            let page_count = pages.len();
            let mut write_backs = Vec::new();
            for upage in pages {
                if let Some(write_back) = state.spt_destroy(pid, upage, &dev) {
                    write_backs.push(write_back);
                }
            }

            // Pinned strays are loads still in flight; their loader frees
            // them when it finds the page gone.
            let stray: Vec<_> = state
                .frames
                .owned_by(pid)
                .into_iter()
                .filter(|frame| state.frames.get(*frame).map_or(false, |f| !f.pinned))
                .collect();
            if !stray.is_empty() {
                log_warn!(
                    LOG_ORIGIN,
                    "{} still owned {} frames after page teardown",
                    pid,
                    stray.len()
                );
            }
            for frame in stray {
                state.free_frame(frame, &dev);
            }

            let files: Vec<FileHandle> = state
                .spaces
                .remove(&pid)
                .map(|space| space.mappings.into_values().map(|m| m.file).collect())
                .unwrap_or_default();

            (write_backs, files, page_count)
        };

        self.flush_write_backs(&write_backs, &files);

        log_info!(
            LOG_ORIGIN,
            "Released {}: {} pages, {} write-backs, {} mappings closed",
            pid,
            page_count,
            write_backs.len(),
            files.len()
        );
    }

    /// Writes staged mapped-page contents back and closes `files`, under the
    /// file-system lock. Must be called without the VM lock.
    pub(crate) fn flush_write_backs(&self, write_backs: &[WriteBack], files: &[FileHandle]) {
        if write_backs.is_empty() && files.is_empty() {
            return;
        }

        let fs = self.fs.lock();
        for write_back in write_backs {
            let written = write_back.file.write_at(&fs, &write_back.data, write_back.offset);
            if written != write_back.data.len() {
                log_warn!(
                    LOG_ORIGIN,
                    "Short write-back at offset {}: {} of {} bytes",
                    write_back.offset,
                    written,
                    write_back.data.len()
                );
            }
        }
        for file in files {
            file.close(&fs);
        }
    }

    pub fn page_info(&self, pid: ProcessId, addr: VirtAddr) -> Option<PageInfo> {
        let state = self.lock_state();
        let handle = state.spt_lookup(pid, page_round_down(addr))?;
        let entry = state.entries.get(handle)?;
        let pinned = match entry.residency() {
            Residency::Resident(frame) => state.frames.get(frame).map_or(false, |f| f.pinned),
            _ => false,
        };

        Some(PageInfo {
            kind: entry.kind(),
            writable: entry.writable(),
            length: entry.backing.length(),
            residency: entry.residency(),
            pinned,
        })
    }

    pub fn page_count(&self, pid: ProcessId) -> usize {
        self.lock_state()
            .spaces
            .get(&pid)
            .map_or(0, |space| space.page_count())
    }

    pub fn stats(&self) -> VmStats {
        let resident_frames = self.lock_state().frames.len();
        let (_, free_frames) = self.pool.get_stats();

        VmStats {
            page_faults: self.counters.page_faults.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            swap_outs: self.counters.swap_outs.load(Ordering::Relaxed),
            swap_ins: self.counters.swap_ins.load(Ordering::Relaxed),
            frame_waits: self.counters.frame_waits.load(Ordering::Relaxed),
            resident_frames,
            free_frames,
        }
    }

    pub fn print_stats(&self) {
        let stats = self.stats();
        log_info!(
            LOG_ORIGIN,
            "{} page faults, {} evictions ({} to swap), {} swap-ins, {} frame waits, {} resident / {} free frames",
            stats.page_faults,
            stats.evictions,
            stats.swap_outs,
            stats.swap_ins,
            stats.frame_waits,
            stats.resident_frames,
            stats.free_frames
        );
    }

    /// Cross-checks the frame table against the page tables. Returns a
    /// description of the first inconsistency found.
    pub fn audit(&self) -> Result<(), &'static str> {
        let state = self.lock_state();

        for frame_entry in state.frames.iter() {
            let Some(entry) = state.entries.get(frame_entry.spte) else {
                return Err("frame table references a destroyed page");
            };
            if entry.residency() != Residency::Resident(frame_entry.frame) {
                return Err("frame table entry disagrees with its page's residency");
            }
            if !self.pool.is_allocated(frame_entry.frame) {
                return Err("frame table holds a frame the pool considers free");
            }
        }

        for (_, entry) in state.entries.iter() {
            if let Residency::Resident(frame) = entry.residency() {
                match state.frames.get(frame) {
                    Some(f) if f.owner == entry.owner() && f.upage == entry.upage() => {}
                    _ => return Err("resident page has no matching frame table entry"),
                }
            }
            let indexed = state
                .spaces
                .get(&entry.owner())
                .and_then(|space| space.spt.lookup(entry.upage()))
                .is_some();
            if !indexed {
                return Err("page entry is not indexed by its owner");
            }
        }

        Ok(())
    }
}

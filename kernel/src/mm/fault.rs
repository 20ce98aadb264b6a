// Page Fault Resolver
//
// Entry point for every #PF raised on behalf of a user process. A fault is
// either resolved in place (the faulting instruction is restarted) or ends
// the process; it never unwinds into the caller and never leaves the frame
// table half-updated.
//
// Resolution order:
// 1. Protection violations and non-user addresses terminate
// 2. A known page is brought in from swap, from its file, or zero-filled
// 3. An unknown page just below or above the saved stack pointer grows the
//    stack, within the configured maximum
// 4. Anything else terminates
//
// Frames being filled are pinned from the moment they are reserved until
// the translation is installed. File reads happen with the VM lock dropped
// and the file-system lock held, never both. Swap I/O happens under the VM
// lock because the swap store has no lock above it.
//
// When every frame is pinned by a load in flight, the fault backs off: it
// drops the VM lock, spins, and starts over from the SPT lookup.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::VirtAddr;

use crate::config::page_round_down;
use crate::mm::addrspace::ProcessId;
use crate::mm::file::FileHandle;
use crate::mm::pmm::Frame;
use crate::mm::spt::{Backing, Residency, SptHandle};
use crate::mm::vm::{Devices, VmManager, VmState};
use crate::mm::VmError;
use crate::{log_debug, log_warn};

const LOG_ORIGIN: &str = "fault";

/// A single `push` may touch memory 4 bytes below the stack pointer.
pub const PUSH_SLACK: u64 = 4;
/// `pusha` touches memory 32 bytes below the stack pointer.
pub const PUSHA_SLACK: u64 = 32;

/// Exit status reported for processes killed by a fault.
pub const EXIT_ERROR: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    pub addr: u64,
    pub not_present: bool,
    pub write: bool,
    pub user: bool,
    /// User stack pointer saved at the last user-to-kernel transition.
    pub esp: u64,
}

impl FaultInfo {
    pub fn from_error_code(addr: u64, code: PageFaultErrorCode, esp: u64) -> Self {
        Self {
            addr,
            not_present: !code.contains(PageFaultErrorCode::PROTECTION_VIOLATION),
            write: code.contains(PageFaultErrorCode::CAUSED_BY_WRITE),
            user: code.contains(PageFaultErrorCode::USER_MODE),
            esp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Resume,
    Terminate(i32),
}

/// A reserved, pinned frame waiting to be filled from a file.
struct PendingRead {
    handle: SptHandle,
    frame: Frame,
    file: FileHandle,
    offset: u64,
    length: usize,
}

enum Step {
    Done,
    /// No frame could be had without waiting for a load to finish.
    Wait,
    ReadFile(PendingRead),
}

impl VmManager {
    pub fn resolve_fault(&self, pid: ProcessId, info: FaultInfo) -> FaultOutcome {
        self.counters().page_faults.fetch_add(1, Ordering::Relaxed);
        log_debug!(
            LOG_ORIGIN,
            "{} {} fault at {:#x} by {}",
            if info.user { "User" } else { "Kernel" },
            if info.write { "write" } else { "read" },
            info.addr,
            pid
        );

        if !info.not_present {
            return self.terminate(pid, info.addr, VmError::ProtectionViolation);
        }

        match self.page_in(pid, VirtAddr::new_truncate(info.addr), info.write, info.esp, false) {
            Ok(()) => FaultOutcome::Resume,
            Err(err) => self.terminate(pid, info.addr, err),
        }
    }

    pub(crate) fn terminate(&self, pid: ProcessId, addr: u64, err: VmError) -> FaultOutcome {
        log_warn!(LOG_ORIGIN, "Killing {}: fault at {:#x} ({:?})", pid, addr, err);
        FaultOutcome::Terminate(EXIT_ERROR)
    }

    /// Makes the page containing `addr` resident. With `keep_pinned` the
    /// frame stays pinned afterwards, even if it was already resident.
    pub(crate) fn page_in(
        &self,
        pid: ProcessId,
        addr: VirtAddr,
        write: bool,
        esp: u64,
        keep_pinned: bool,
    ) -> Result<(), VmError> {
        if !self.config().is_user_vaddr(addr) {
            return Err(VmError::InvalidAddress);
        }

        let upage = page_round_down(addr);
        let dev = self.devices();

        loop {
            let pending = {
                let mut state = self.lock_state();
                match self.page_in_locked(&mut state, pid, addr, upage, write, esp, keep_pinned, &dev)? {
                    Step::Done => return Ok(()),
                    Step::Wait => None,
                    Step::ReadFile(pending) => {
                        state.loads_in_flight += 1;
                        Some(pending)
                    }
                }
            };
            let Some(pending) = pending else {
                core::hint::spin_loop();
                continue;
            };

            let read = {
                let fs = self.fs_lock().lock();
                let mut page = self.pool().contents(pending.frame);
                let read = pending
                    .file
                    .read_at(&fs, &mut page[..pending.length], pending.offset);
                page[pending.length..].fill(0);
                read
            };

            let mut state = self.lock_state();
            state.loads_in_flight -= 1;
            if read != pending.length {
                log_debug!(
                    LOG_ORIGIN,
                    "Short read for {:#x}: {} of {} bytes",
                    upage.as_u64(),
                    read,
                    pending.length
                );
                state.free_frame(pending.frame, &dev);
                return Err(VmError::ShortRead);
            }

            // Another fault loaded the page and it was evicted to swap while
            // this read ran.
            let swapped_meanwhile = state
                .entries
                .get(pending.handle)
                .map_or(false, |entry| matches!(entry.residency, Residency::Swapped(_)));
            if swapped_meanwhile {
                state.free_frame(pending.frame, &dev);
                drop(state);
                continue;
            }

            log_debug!(
                LOG_ORIGIN,
                "Loaded {:#x} of {} from file offset {} into {}",
                upage.as_u64(),
                pid,
                pending.offset,
                pending.frame
            );
            return state.commit_frame(pending.handle, pending.frame, keep_pinned, &dev);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn page_in_locked(
        &self,
        state: &mut VmState,
        pid: ProcessId,
        addr: VirtAddr,
        upage: VirtAddr,
        write: bool,
        esp: u64,
        keep_pinned: bool,
        dev: &Devices<'_>,
    ) -> Result<Step, VmError> {
        let Some(handle) = state.spt_lookup(pid, upage) else {
            return self.grow_stack(state, pid, addr, upage, esp, keep_pinned, dev);
        };
        let Some(entry) = state.entries.get_mut(handle) else {
            return Err(VmError::NotMapped);
        };

        if write && !entry.writable {
            return Err(VmError::ProtectionViolation);
        }

        let residency = entry.residency;
        match residency {
            Residency::Resident(frame) => {
                if keep_pinned {
                    state.frames.set_pinned(frame, true);
                }
                Ok(Step::Done)
            }
            Residency::Swapped(slot) => {
                let Some(frame) = state.reserve_frame(pid, upage, handle, dev) else {
                    return Ok(Step::Wait);
                };
                dev.swap.read_in(slot, &mut dev.pool.contents(frame));
                dev.counters.swap_ins.fetch_add(1, Ordering::Relaxed);

                // The slot stays the page's only copy until the frame is
                // mapped; a failed commit leaves the page swapped.
                state.commit_frame(handle, frame, keep_pinned, dev)?;
                dev.swap.release(slot);
                if let Some(space) = state.spaces.get(&pid) {
                    space.dir.set_dirty(upage, true);
                }

                log_debug!(LOG_ORIGIN, "Swapped in {:#x} of {} from {}", upage.as_u64(), pid, slot);
                Ok(Step::Done)
            }
            Residency::Unloaded => {
                let source = entry
                    .backing
                    .file_source()
                    .filter(|(_, _, length)| *length > 0)
                    .map(|(file, offset, length)| (Arc::clone(file), offset, length));

                let Some(frame) = state.reserve_frame(pid, upage, handle, dev) else {
                    return Ok(Step::Wait);
                };
                match source {
                    Some((file, offset, length)) => Ok(Step::ReadFile(PendingRead {
                        handle,
                        frame,
                        file,
                        offset,
                        length,
                    })),
                    None => {
                        dev.pool.contents(frame).fill(0);
                        state.commit_frame(handle, frame, keep_pinned, dev)?;
                        Ok(Step::Done)
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn grow_stack(
        &self,
        state: &mut VmState,
        pid: ProcessId,
        addr: VirtAddr,
        upage: VirtAddr,
        esp: u64,
        keep_pinned: bool,
        dev: &Devices<'_>,
    ) -> Result<Step, VmError> {
        let addr = addr.as_u64();
        let near_esp =
            addr >= esp || addr == esp.wrapping_sub(PUSH_SLACK) || addr == esp.wrapping_sub(PUSHA_SLACK);
        if !near_esp {
            return Err(VmError::NotMapped);
        }
        if !self.config().in_stack_region(upage) {
            return Err(VmError::StackOverflow);
        }

        let handle = state.spt_create(pid, upage, Backing::Stack, true)?;
        let Some(frame) = state.reserve_frame(pid, upage, handle, dev) else {
            state.spt_destroy(pid, upage, dev);
            return Ok(Step::Wait);
        };
        dev.pool.contents(frame).fill(0);

        if let Err(err) = state.commit_frame(handle, frame, keep_pinned, dev) {
            state.spt_destroy(pid, upage, dev);
            return Err(err);
        }

        log_debug!(LOG_ORIGIN, "Grew stack of {} to {:#x}", pid, upage.as_u64());
        Ok(Step::Done)
    }
}

impl VmState {
    /// Publishes a filled, pinned frame as the page's home and maps it. On
    /// failure the frame is released and the page keeps its previous
    /// residency.
    pub(crate) fn commit_frame(
        &mut self,
        handle: SptHandle,
        frame: Frame,
        keep_pinned: bool,
        dev: &Devices<'_>,
    ) -> Result<(), VmError> {
        let Some(entry) = self.entries.get_mut(handle) else {
            // The page was destroyed while its contents were being read.
            self.free_frame(frame, dev);
            return Err(VmError::NotMapped);
        };

        if let Residency::Resident(current) = entry.residency {
            if current != frame {
                self.free_frame(frame, dev);
                if keep_pinned {
                    self.frames.set_pinned(current, true);
                }
                return Ok(());
            }
        }
        let previous = entry.residency;
        entry.residency = Residency::Resident(frame);

        if !self.install_frame(frame) {
            if let Some(entry) = self.entries.get_mut(handle) {
                entry.residency = previous;
            }
            self.free_frame(frame, dev);
            return Err(VmError::InstallFailed);
        }

        if !keep_pinned {
            self.frames.set_pinned(frame, false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_MAX_STACK_SIZE, PAGE_SIZE};
    use crate::mm::pagedir::PageDirectory;
    use crate::mm::spt::PageKind;
    use crate::mm::testkit::{MemFile, Machine, STACK_TOP};

    const PAGE: u64 = PAGE_SIZE as u64;

    #[test]
    fn decodes_hardware_error_code() {
        let code = PageFaultErrorCode::CAUSED_BY_WRITE | PageFaultErrorCode::USER_MODE;
        let info = FaultInfo::from_error_code(0x1234, code, 0xBFFF_FF00);
        assert!(info.not_present);
        assert!(info.write);
        assert!(info.user);

        let info = FaultInfo::from_error_code(0x1234, PageFaultErrorCode::PROTECTION_VIOLATION, 0);
        assert!(!info.not_present);
        assert!(!info.write);
        assert!(!info.user);
    }

    #[test]
    fn protection_violation_terminates() {
        let m = Machine::new(4, 4);
        let pid = m.spawn(1);
        let info = FaultInfo {
            addr: STACK_TOP - 8,
            not_present: false,
            write: true,
            user: true,
            esp: STACK_TOP - 8,
        };
        assert_eq!(m.vm.resolve_fault(pid, info), FaultOutcome::Terminate(EXIT_ERROR));
    }

    #[test]
    fn kernel_address_terminates() {
        let m = Machine::new(4, 4);
        let pid = m.spawn(1);
        assert_eq!(m.fault(pid, 0xC000_1000, false, 0xC000_0000), FaultOutcome::Terminate(EXIT_ERROR));
        assert_eq!(m.vm.page_count(pid), 0);
    }

    #[test]
    fn wild_access_far_below_stack_pointer_terminates() {
        let m = Machine::new(4, 4);
        let pid = m.spawn(1);
        let esp = STACK_TOP - 16;
        assert_eq!(m.fault(pid, esp - 64, true, esp), FaultOutcome::Terminate(EXIT_ERROR));
        assert_eq!(m.fault(pid, 0, false, esp), FaultOutcome::Terminate(EXIT_ERROR));
    }

    #[test]
    fn push_and_pusha_just_below_esp_grow_the_stack() {
        let m = Machine::new(4, 4);
        let pid = m.spawn(1);
        let esp = STACK_TOP - PAGE;

        assert_eq!(m.fault(pid, esp - PUSH_SLACK, true, esp), FaultOutcome::Resume);
        assert_eq!(m.fault(pid, esp - PAGE - PUSHA_SLACK, true, esp - PAGE), FaultOutcome::Resume);
        assert_eq!(m.vm.page_count(pid), 2);
    }

    #[test]
    fn stack_growth_stops_at_the_maximum() {
        let m = Machine::new(4, 4);
        let pid = m.spawn(1);
        let floor = STACK_TOP - DEFAULT_MAX_STACK_SIZE;

        let beyond = floor - PAGE;
        assert_eq!(m.fault(pid, beyond, true, beyond), FaultOutcome::Terminate(EXIT_ERROR));
        assert_eq!(m.vm.page_count(pid), 0);

        let inside = floor + PAGE;
        assert_eq!(m.fault(pid, inside, true, inside), FaultOutcome::Resume);
        assert_eq!(m.vm.page_count(pid), 1);
        let info = m.vm.page_info(pid, VirtAddr::new(inside)).unwrap();
        assert_eq!(info.kind, PageKind::Stack);
        assert!(info.writable);
    }

    #[test]
    fn file_page_is_read_lazily_and_zero_padded() {
        let m = Machine::new(4, 4);
        let pid = m.spawn(1);
        let file = MemFile::with_contents(&[0x5A; 100]);
        m.vm
            .register_segment(pid, VirtAddr::new(0x0804_8000), &file.handle(), 0, 100, false)
            .unwrap();

        assert_eq!(file.reads(), 0);
        assert_eq!(m.read(pid, 0x0804_8000 + 99), Ok(0x5A));
        assert_eq!(m.read(pid, 0x0804_8000 + 100), Ok(0));
        assert_eq!(m.read(pid, 0x0804_8000 + PAGE - 1), Ok(0));
        assert_eq!(file.reads(), 1);
    }

    #[test]
    fn write_to_read_only_segment_terminates() {
        let m = Machine::new(4, 4);
        let pid = m.spawn(1);
        let file = MemFile::with_contents(&[1; 16]);
        m.vm
            .register_segment(pid, VirtAddr::new(0x0804_8000), &file.handle(), 0, 16, false)
            .unwrap();

        assert_eq!(m.write(pid, 0x0804_8000, 9), Err(FaultOutcome::Terminate(EXIT_ERROR)));
    }

    #[test]
    fn short_read_frees_the_frame_and_terminates() {
        let m = Machine::new(1, 4);
        let pid = m.spawn(1);
        let file = MemFile::with_contents(&[7; 10]);
        m.vm
            .register_segment(pid, VirtAddr::new(0x0804_8000), &file.handle(), 0, 200, true)
            .unwrap();

        assert_eq!(m.read(pid, 0x0804_8000), Err(FaultOutcome::Terminate(EXIT_ERROR)));
        assert_eq!(m.pool.get_stats(), (1, 1));
        let info = m.vm.page_info(pid, VirtAddr::new(0x0804_8000)).unwrap();
        assert_eq!(info.residency, Residency::Unloaded);
        m.vm.audit().unwrap();
    }

    #[test]
    fn failed_install_releases_its_frame() {
        let m = Machine::new(2, 4);
        let pid = m.spawn(1);
        m.dir(pid).set_refuse_installs(true);

        let esp = STACK_TOP - 8;
        assert_eq!(m.fault(pid, esp, true, esp), FaultOutcome::Terminate(EXIT_ERROR));
        assert_eq!(m.pool.get_stats(), (2, 2));
        assert_eq!(m.vm.stats().resident_frames, 0);
        assert_eq!(m.vm.page_count(pid), 0);
        m.vm.audit().unwrap();
    }

    #[test]
    fn dirty_file_page_round_trips_through_swap() {
        let m = Machine::new(1, 4);
        let pid = m.spawn(1);
        let file = MemFile::with_contents(&[0u8; 2 * PAGE_SIZE]);
        let base = 0x0804_8000u64;
        m.vm
            .register_segment(pid, VirtAddr::new(base), &file.handle(), 0, PAGE_SIZE, true)
            .unwrap();
        m.vm
            .register_segment(pid, VirtAddr::new(base + PAGE), &file.handle(), PAGE, PAGE_SIZE, true)
            .unwrap();

        let pattern: alloc::vec::Vec<u8> = (0..64).map(|i| (i * 7 + 3) as u8).collect();
        for (i, b) in pattern.iter().enumerate() {
            m.write(pid, base + i as u64 * 61, *b).unwrap();
        }

        // Touching the second page evicts the dirty first page into swap.
        m.read(pid, base + PAGE).unwrap();
        let info = m.vm.page_info(pid, VirtAddr::new(base)).unwrap();
        assert!(matches!(info.residency, Residency::Swapped(_)));

        for (i, b) in pattern.iter().enumerate() {
            assert_eq!(m.read(pid, base + i as u64 * 61), Ok(*b));
        }
        assert_eq!(m.vm.stats().swap_ins, 1);
        // Swapped-in pages are treated as dirty.
        assert!(m.dir(pid).is_dirty(VirtAddr::new(base)));
        assert_eq!(file.writes().len(), 0);
        m.vm.audit().unwrap();
    }

    #[test]
    fn failed_swap_in_keeps_the_page_in_swap() {
        let m = Machine::new(1, 4);
        let pid = m.spawn(1);
        let esp = STACK_TOP - 2 * PAGE;
        m.set_esp(pid, esp);
        m.write(pid, esp, 0x77).unwrap();
        m.write(pid, esp + PAGE, 0x88).unwrap();
        let slot = match m.vm.page_info(pid, VirtAddr::new(esp)).unwrap().residency {
            Residency::Swapped(slot) => slot,
            other => panic!("expected a swapped page, found {:?}", other),
        };

        m.dir(pid).set_refuse_installs(true);
        assert_eq!(m.read(pid, esp), Err(FaultOutcome::Terminate(EXIT_ERROR)));
        let info = m.vm.page_info(pid, VirtAddr::new(esp)).unwrap();
        assert_eq!(info.residency, Residency::Swapped(slot));
        assert_eq!(m.pool.get_stats(), (1, 1));
        m.vm.audit().unwrap();

        m.dir(pid).set_refuse_installs(false);
        assert_eq!(m.read(pid, esp), Ok(0x77));
        assert_eq!(m.read(pid, esp + PAGE), Ok(0x88));
    }

    #[test]
    fn failed_swap_in_of_a_mapping_still_writes_back() {
        let m = Machine::new(1, 4);
        let pid = m.spawn(1);
        let file = MemFile::with_contents(b"hello");
        m.vm.mmap(pid, &file.handle(), 0x1000_0000).unwrap();
        m.write(pid, 0x1000_0000, b'j').unwrap();

        let esp = STACK_TOP - 8;
        m.set_esp(pid, esp);
        m.write(pid, esp, 1).unwrap();
        let info = m.vm.page_info(pid, VirtAddr::new(0x1000_0000)).unwrap();
        assert!(matches!(info.residency, Residency::Swapped(_)));

        m.dir(pid).set_refuse_installs(true);
        assert_eq!(m.read(pid, 0x1000_0000), Err(FaultOutcome::Terminate(EXIT_ERROR)));

        m.vm.release_all(pid);
        assert_eq!(file.contents(), b"jello");
        assert_eq!(m.swap.free_slots(), 4);
    }

    #[test]
    fn clean_file_page_is_dropped_and_reread() {
        let m = Machine::new(1, 4);
        let pid = m.spawn(1);
        let file = MemFile::with_contents(&[0x11; PAGE_SIZE]);
        m.vm
            .register_segment(pid, VirtAddr::new(0x0804_8000), &file.handle(), 0, PAGE_SIZE, false)
            .unwrap();
        let esp = STACK_TOP - 8;

        assert_eq!(m.read(pid, 0x0804_8000), Ok(0x11));
        m.set_esp(pid, esp);
        m.write(pid, esp, 1).unwrap();

        let info = m.vm.page_info(pid, VirtAddr::new(0x0804_8000)).unwrap();
        assert_eq!(info.residency, Residency::Unloaded);
        assert_eq!(m.swap.free_slots(), 4);

        assert_eq!(m.read(pid, 0x0804_8000), Ok(0x11));
        assert_eq!(file.reads(), 2);
    }
}

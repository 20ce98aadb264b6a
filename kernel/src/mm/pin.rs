// User Buffer Pinning
//
// System calls such as read and write move data between a user buffer and
// the file system while holding the file-system lock. A fault inside that
// window would need the VM lock and, for a file-backed page, the file-system
// lock again. To keep faults out of it, the system-call layer pins the whole
// buffer first: every page is made resident and its frame is pinned so the
// clock cannot take it, then the buffer is unpinned once the transfer is over.
//
// Pinning follows the same rules as a user fault, so a buffer on a not yet
// grown stack or in a lazily loaded segment is fine, and a buffer that a
// user access could not reach terminates the caller.

use x86_64::VirtAddr;

use crate::config::PAGE_SIZE;
use crate::mm::addrspace::ProcessId;
use crate::mm::fault::FaultOutcome;
use crate::mm::spt::Residency;
use crate::mm::vm::VmManager;
use crate::mm::VmError;

impl VmManager {
    /// Faults in and pins every page of `[addr, addr + len)`. `write` asks
    /// for pages the caller may store into.
    pub fn pin_user_buffer(
        &self,
        pid: ProcessId,
        addr: u64,
        len: usize,
        write: bool,
        esp: u64,
    ) -> FaultOutcome {
        let pages = match Self::buffer_pages(addr, len) {
            Ok(pages) => pages,
            Err(err) => return self.terminate(pid, addr, err),
        };

        for (pinned, upage) in pages.clone().enumerate() {
            // The first page may start mid-page; the stack rule looks at the
            // real address, not the page base.
            let target = if pinned == 0 { addr } else { upage };
            if let Err(err) = self.page_in(pid, VirtAddr::new_truncate(target), write, esp, true) {
                self.unpin_pages(pid, pages.clone().take(pinned));
                return self.terminate(pid, target, err);
            }
        }
        FaultOutcome::Resume
    }

    pub fn unpin_user_buffer(&self, pid: ProcessId, addr: u64, len: usize) {
        if let Ok(pages) = Self::buffer_pages(addr, len) {
            self.unpin_pages(pid, pages);
        }
    }

    fn unpin_pages(&self, pid: ProcessId, pages: impl Iterator<Item = u64>) {
        let mut state = self.lock_state();
        for upage in pages {
            let Some(handle) = state.spt_lookup(pid, VirtAddr::new_truncate(upage)) else {
                continue;
            };
            if let Some(Residency::Resident(frame)) = state.entries.get(handle).map(|e| e.residency()) {
                state.frames.set_pinned(frame, false);
            }
        }
    }

    fn buffer_pages(addr: u64, len: usize) -> Result<core::iter::StepBy<core::ops::Range<u64>>, VmError> {
        let page = PAGE_SIZE as u64;
        let first = addr & !(page - 1);
        let last = addr.checked_add(len as u64).ok_or(VmError::InvalidAddress)?;
        let end = if len == 0 { first } else { last };
        Ok((first..end).step_by(PAGE_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::fault::EXIT_ERROR;
    use crate::mm::testkit::{MemFile, Machine, STACK_TOP};

    const PAGE: u64 = PAGE_SIZE as u64;

    #[test]
    fn pinned_buffer_survives_memory_pressure() {
        let m = Machine::new(3, 8);
        let pid = m.spawn(1);
        let file = MemFile::with_contents(&[4u8; 2 * PAGE_SIZE]);
        m.vm.mmap(pid, &file.handle(), 0x1000_0000).unwrap();

        // Buffer straddles both mapped pages.
        let buf = 0x1000_0000 + PAGE - 10;
        assert_eq!(m.vm.pin_user_buffer(pid, buf, 20, true, STACK_TOP), FaultOutcome::Resume);
        assert!(m.vm.page_info(pid, VirtAddr::new(buf)).unwrap().pinned);
        assert!(m.vm.page_info(pid, VirtAddr::new(buf + 19)).unwrap().pinned);

        m.set_esp(pid, STACK_TOP - 5 * PAGE);
        for i in 1..=4 {
            m.write(pid, STACK_TOP - i * PAGE, i as u8).unwrap();
        }
        for a in [buf, buf + 19] {
            let info = m.vm.page_info(pid, VirtAddr::new(a)).unwrap();
            assert!(matches!(info.residency, Residency::Resident(_)));
        }

        m.vm.unpin_user_buffer(pid, buf, 20);
        assert!(!m.vm.page_info(pid, VirtAddr::new(buf)).unwrap().pinned);
        m.write(pid, STACK_TOP - 5 * PAGE, 5).unwrap();
        m.vm.audit().unwrap();
    }

    #[test]
    fn buffer_on_fresh_stack_grows_it() {
        let m = Machine::new(4, 4);
        let pid = m.spawn(1);
        let esp = STACK_TOP - 2 * PAGE;

        assert_eq!(m.vm.pin_user_buffer(pid, esp, 2 * PAGE_SIZE, true, esp), FaultOutcome::Resume);
        assert_eq!(m.vm.page_count(pid), 2);
        m.vm.unpin_user_buffer(pid, esp, 2 * PAGE_SIZE);
    }

    #[test]
    fn unreachable_buffer_unpins_and_terminates() {
        let m = Machine::new(4, 4);
        let pid = m.spawn(1);
        let file = MemFile::with_contents(&[1u8; PAGE_SIZE]);
        m.vm.mmap(pid, &file.handle(), 0x1000_0000).unwrap();

        // Second page of the buffer is not mapped and not near the stack.
        let outcome = m.vm.pin_user_buffer(pid, 0x1000_0000, 2 * PAGE_SIZE, false, STACK_TOP);
        assert_eq!(outcome, FaultOutcome::Terminate(EXIT_ERROR));
        assert!(!m.vm.page_info(pid, VirtAddr::new(0x1000_0000)).unwrap().pinned);
    }

    #[test]
    fn kernel_buffer_terminates() {
        let m = Machine::new(4, 4);
        let pid = m.spawn(1);
        let outcome = m.vm.pin_user_buffer(pid, STACK_TOP + 8, 16, false, STACK_TOP - 8);
        assert_eq!(outcome, FaultOutcome::Terminate(EXIT_ERROR));
    }
}

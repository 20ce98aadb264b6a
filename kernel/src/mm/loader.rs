// Executable Segment Registration
//
// Decides which pages of a new process image are loaded lazily and from
// where. The program loader hands over each loadable segment header; this
// module validates it, splits it into pages and records one `FileBacked`
// SPT entry per page. No file data is read here.
//
// Segment validation:
// - File offset and virtual address share the same offset within a page
// - The file offset lies within the file
// - Memory size is non-zero and at least the file size
// - The whole region lies in user space, does not wrap, and does not touch
//   page 0 (so null dereferences always fault)
//
// Page splitting:
// - Each page reads at most one page of file bytes; the rest is zero-filled
// - Pages past the end of the file part (bss) have length 0 and are never
//   read from the file
// - Two segments sharing a page merge into one entry: writable if either
//   is, and reading as many bytes as the longer of the two
// - A segment that cannot be registered in full leaves no page behind;
//   entries it merged into keep the merge
//
// The initial stack page is the one page created eagerly; every other page
// of the process appears on first touch.

use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::config::{is_page_aligned, page_offset, pages_for, PAGE_SIZE};
use crate::mm::addrspace::ProcessId;
use crate::mm::file::FileHandle;
use crate::mm::spt::Backing;
use crate::mm::vm::{VmManager, VmState};
use crate::mm::VmError;
use crate::{log_debug, log_info};

const LOG_ORIGIN: &str = "loader";

/// Loadable program segment, as described by its program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub file_offset: u64,
    pub vaddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub writable: bool,
}

impl SegmentHeader {
    fn validate(&self, file_length: u64, user_top: u64) -> Result<(), VmError> {
        let page_mask = PAGE_SIZE as u64 - 1;
        if self.file_offset & page_mask != self.vaddr & page_mask {
            return Err(VmError::InvalidSegment);
        }
        if self.file_offset > file_length {
            return Err(VmError::InvalidSegment);
        }
        if self.mem_size < self.file_size || self.mem_size == 0 {
            return Err(VmError::InvalidSegment);
        }

        let end = self
            .vaddr
            .checked_add(self.mem_size)
            .ok_or(VmError::InvalidSegment)?;
        if self.vaddr >= user_top || end > user_top {
            return Err(VmError::InvalidSegment);
        }
        if self.vaddr < PAGE_SIZE as u64 {
            return Err(VmError::InvalidSegment);
        }
        Ok(())
    }
}

impl VmManager {
    /// Records that `upage` is to be filled with `length` bytes of `file`
    /// starting at `offset`, zero-padded to a page.
    pub fn register_segment(
        &self,
        pid: ProcessId,
        upage: VirtAddr,
        file: &FileHandle,
        offset: u64,
        length: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        let mut state = self.lock_state();
        self.register_segment_locked(&mut state, pid, upage, file, offset, length, writable)?;
        Ok(())
    }

    /// Returns true if a new entry was created, false if an existing one
    /// absorbed the page.
    #[allow(clippy::too_many_arguments)]
    fn register_segment_locked(
        &self,
        state: &mut VmState,
        pid: ProcessId,
        upage: VirtAddr,
        file: &FileHandle,
        offset: u64,
        length: usize,
        writable: bool,
    ) -> Result<bool, VmError> {
        if !is_page_aligned(upage) {
            return Err(VmError::Unaligned);
        }
        if upage.as_u64() == 0 || !self.config().is_user_vaddr(upage) {
            return Err(VmError::InvalidAddress);
        }
        if length > PAGE_SIZE {
            return Err(VmError::InvalidSegment);
        }

        if let Some(handle) = state.spt_lookup(pid, upage) {
            let entry = state.entries.get_mut(handle).ok_or(VmError::NotMapped)?;
            let Backing::File { length: current, .. } = &mut entry.backing else {
                return Err(VmError::AlreadyMapped);
            };
            *current = (*current).max(length);
            entry.writable |= writable;

            log_debug!(
                LOG_ORIGIN,
                "Merged segment page {:#x} of {} (length {}, writable {})",
                upage.as_u64(),
                pid,
                *current,
                entry.writable
            );
            return Ok(false);
        }

        let backing = Backing::File {
            file: file.clone(),
            offset,
            length,
        };
        state.spt_create(pid, upage, backing, writable)?;
        Ok(true)
    }

    pub fn load_segment(
        &self,
        pid: ProcessId,
        file: &FileHandle,
        header: SegmentHeader,
    ) -> Result<(), VmError> {
        let file_length = file.length(&self.fs_lock().lock());
        header.validate(file_length, self.config().user_top)?;

        let start = VirtAddr::new(header.vaddr);
        let lead = page_offset(start) as u64;
        let mut upage = start.align_down(PAGE_SIZE as u64);
        let mut offset = header.file_offset - lead;

        let mut read_bytes = if header.file_size > 0 {
            lead + header.file_size
        } else {
            0
        };
        let page_count = pages_for(lead + header.mem_size);

        let mut state = self.lock_state();
        let mut created: Vec<VirtAddr> = Vec::new();
        for _ in 0..page_count {
            let page_read = read_bytes.min(PAGE_SIZE as u64) as usize;
            match self.register_segment_locked(
                &mut state,
                pid,
                upage,
                file,
                offset,
                page_read,
                header.writable,
            ) {
                Ok(true) => created.push(upage),
                Ok(false) => {}
                Err(err) => {
                    let dev = self.devices();
                    for upage in created {
                        state.spt_destroy(pid, upage, &dev);
                    }
                    return Err(err);
                }
            }

            read_bytes -= page_read as u64;
            offset += PAGE_SIZE as u64;
            upage += PAGE_SIZE as u64;
        }
        drop(state);

        log_info!(
            LOG_ORIGIN,
            "{} segment at {:#x}: {} pages ({} file bytes, {} memory bytes{})",
            pid,
            header.vaddr,
            page_count,
            header.file_size,
            header.mem_size,
            if header.writable { ", writable" } else { "" }
        );
        Ok(())
    }

    /// Creates the first stack page just below the top of user space and
    /// returns the initial stack pointer.
    pub fn setup_stack(&self, pid: ProcessId) -> Result<VirtAddr, VmError> {
        let top = self.config().user_top_addr();
        let upage = top - PAGE_SIZE as u64;

        if self.lock_state().spt_lookup(pid, upage).is_some() {
            return Err(VmError::AlreadyMapped);
        }
        self.page_in(pid, upage, true, upage.as_u64(), false)?;
        Ok(top)
    }
}

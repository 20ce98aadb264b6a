// Memory-Mapped Files
//
// Maps a file into a contiguous run of user pages. Nothing is read at map
// time: every page is registered as a lazily-loaded `MemoryMapped` SPT entry
// and brought in by the fault resolver on first touch. Modified pages are
// written back to the file when the mapping is torn down, either explicitly
// through `munmap` or when the process exits.
//
// Mapping rules:
// - The start address must be non-null, page-aligned and in user space
// - The file is reopened so each mapping has its own position
// - An empty file cannot be mapped
// - No page may overlap an existing page or the reserved stack region;
//   on conflict every page created so far is rolled back
// - The last page holds the file's tail and is zero-padded
//
// Teardown writes back only pages whose dirty bit is set (or which were
// pushed to swap, which only happens to dirty pages), each at its own file
// offset and never past the bytes it was loaded from.

use alloc::vec::Vec;
use x86_64::VirtAddr;

use crate::config::{is_page_aligned, pages_for, PAGE_SIZE};
use crate::mm::addrspace::{MapId, Mapping, ProcessId};
use crate::mm::file::FileHandle;
use crate::mm::spt::{Backing, WriteBack};
use crate::mm::vm::VmManager;
use crate::mm::VmError;
use crate::{log_info, log_warn};

const LOG_ORIGIN: &str = "mmap";

impl VmManager {
    pub fn mmap(&self, pid: ProcessId, file: &FileHandle, addr: u64) -> Result<MapId, VmError> {
        let start = VirtAddr::try_new(addr).map_err(|_| VmError::InvalidAddress)?;
        if addr == 0 || !self.config().is_user_vaddr(start) {
            return Err(VmError::InvalidAddress);
        }
        if !is_page_aligned(start) {
            return Err(VmError::Unaligned);
        }

        let (file, length) = {
            let fs = self.fs_lock().lock();
            let reopened = file.reopen(&fs).ok_or(VmError::ReopenFailed)?;
            let length = reopened.length(&fs);
            if length == 0 {
                reopened.close(&fs);
                return Err(VmError::EmptyFile);
            }
            (reopened, length)
        };

        let result = self.register_mapping(pid, start, &file, length);
        match result {
            Ok(id) => {
                log_info!(
                    LOG_ORIGIN,
                    "{} mapped {} bytes at {:#x} as {}",
                    pid,
                    length,
                    addr,
                    id
                );
                Ok(id)
            }
            Err(err) => {
                log_warn!(LOG_ORIGIN, "{} failed to map at {:#x}: {:?}", pid, addr, err);
                file.close(&self.fs_lock().lock());
                Err(err)
            }
        }
    }

    fn register_mapping(
        &self,
        pid: ProcessId,
        start: VirtAddr,
        file: &FileHandle,
        length: u64,
    ) -> Result<MapId, VmError> {
        let page_count = pages_for(length);
        let dev = self.devices();
        let mut state = self.lock_state();

        let map = state
            .spaces
            .get_mut(&pid)
            .ok_or(VmError::NoSuchProcess)?
            .allocate_map_id();

        let mut created: Vec<VirtAddr> = Vec::new();
        let mut failure = None;

        for i in 0..page_count {
            let offset = i * PAGE_SIZE as u64;
            let upage = start + offset;

            if !self.config().is_user_vaddr(upage) {
                failure = Some(VmError::InvalidAddress);
                break;
            }
            if self.config().in_stack_region(upage) {
                failure = Some(VmError::StackRegion);
                break;
            }

            let backing = Backing::Mapped {
                map,
                file: file.clone(),
                offset,
                length: (length - offset).min(PAGE_SIZE as u64) as usize,
            };
            match state.spt_create(pid, upage, backing, true) {
                Ok(_) => created.push(upage),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            for upage in created {
                state.spt_destroy(pid, upage, &dev);
            }
            return Err(err);
        }

        let space = state.spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess)?;
        space.mappings.insert(
            map,
            Mapping {
                id: map,
                start,
                page_count,
                file: file.clone(),
            },
        );
        Ok(map)
    }

    pub fn munmap(&self, pid: ProcessId, map: MapId) -> Result<(), VmError> {
        let dev = self.devices();

        let (mapping, write_backs) = {
            let mut state = self.lock_state();
            let space = state.spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess)?;
            let mapping = space.mappings.remove(&map).ok_or(VmError::NotMapped)?;

            let write_backs: Vec<WriteBack> = (0..mapping.page_count)
                .filter_map(|i| {
                    let upage = mapping.start + i * PAGE_SIZE as u64;
                    state.spt_destroy(pid, upage, &dev)
                })
                .collect();
            (mapping, write_backs)
        };

        self.flush_write_backs(&write_backs, core::slice::from_ref(&mapping.file));

        log_info!(
            LOG_ORIGIN,
            "{} unmapped {} ({} pages, {} written back)",
            pid,
            map,
            mapping.page_count,
            write_backs.len()
        );
        Ok(())
    }

    pub fn mapping(&self, pid: ProcessId, map: MapId) -> Option<Mapping> {
        self.lock_state()
            .spaces
            .get(&pid)?
            .mappings
            .get(&map)
            .cloned()
    }
}

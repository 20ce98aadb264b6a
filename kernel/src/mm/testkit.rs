// Test harness: in-memory files and a simulated MMU.
//
// `Machine` wires a `VmManager` to a small frame pool, a RAM-disk swap area
// and one `SoftPageDirectory` per process. Its `read`/`write` perform user
// loads and stores the way the CPU would: through the page directory
// (setting accessed/dirty bits), raising a fault into the resolver whenever
// the page is absent, and retrying after `Resume`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::vec::Vec;

use x86_64::VirtAddr;

use crate::config::{page_offset, page_round_down, VmConfig, DEFAULT_USER_TOP};
use crate::mm::addrspace::ProcessId;
use crate::mm::fault::{FaultInfo, FaultOutcome};
use crate::mm::file::{BackingFile, FileHandle, FsGuard, FsLock};
use crate::mm::pagedir::{Access, SoftPageDirectory};
use crate::mm::pmm::{FramePool, PageBuf};
use crate::mm::swap::{RamDisk, SwapArea};
use crate::mm::vm::VmManager;

pub const STACK_TOP: u64 = DEFAULT_USER_TOP;

const MAX_FAULTS_PER_ACCESS: usize = 1000;

#[derive(Default)]
struct Inode {
    data: Mutex<Vec<u8>>,
    writes: Mutex<Vec<(u64, usize)>>,
    reads: AtomicUsize,
    closes: AtomicUsize,
    hold_reads: AtomicBool,
}

/// A file whose contents live in memory. Every handle opened from it shares
/// the same inode, so the test keeps one and inspects what the VM did.
#[derive(Clone)]
pub struct MemFile {
    inode: Arc<Inode>,
}

impl MemFile {
    pub fn with_contents(bytes: &[u8]) -> Self {
        let inode = Inode::default();
        *inode.data.lock().unwrap() = bytes.to_vec();
        Self {
            inode: Arc::new(inode),
        }
    }

    pub fn handle(&self) -> FileHandle {
        Arc::new(self.clone())
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inode.data.lock().unwrap().clone()
    }

    /// `(offset, bytes written)` for every write, in order.
    pub fn writes(&self) -> Vec<(u64, usize)> {
        self.inode.writes.lock().unwrap().clone()
    }

    /// While held, `read_at` counts itself and then blocks, like a read
    /// stuck on a slow disk.
    pub fn hold_reads(&self, hold: bool) {
        self.inode.hold_reads.store(hold, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.inode.reads.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inode.closes.load(Ordering::SeqCst)
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, _fs: &FsGuard<'_>, buf: &mut [u8], offset: u64) -> usize {
        self.inode.reads.fetch_add(1, Ordering::SeqCst);
        while self.inode.hold_reads.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        let data = self.inode.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    fn write_at(&self, _fs: &FsGuard<'_>, buf: &[u8], offset: u64) -> usize {
        let mut data = self.inode.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        self.inode.writes.lock().unwrap().push((offset, n));
        n
    }

    fn length(&self, _fs: &FsGuard<'_>) -> u64 {
        self.inode.data.lock().unwrap().len() as u64
    }

    fn reopen(&self, _fs: &FsGuard<'_>) -> Option<FileHandle> {
        Some(self.handle())
    }

    fn close(&self, _fs: &FsGuard<'_>) {
        self.inode.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Machine {
    pub vm: VmManager,
    pub pool: Arc<FramePool>,
    pub swap: Arc<SwapArea<RamDisk>>,
    dirs: Mutex<BTreeMap<ProcessId, Arc<SoftPageDirectory>>>,
    esp: Mutex<BTreeMap<ProcessId, u64>>,
}

impl Machine {
    pub fn new(frames: usize, swap_pages: usize) -> Self {
        let pool = Arc::new(FramePool::new(frames));
        let swap = Arc::new(SwapArea::new(RamDisk::with_pages(swap_pages)));
        let vm = VmManager::new(
            VmConfig::new(),
            pool.clone(),
            swap.clone(),
            Arc::new(FsLock::new()),
        );

        Self {
            vm,
            pool,
            swap,
            dirs: Mutex::new(BTreeMap::new()),
            esp: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn spawn(&self, raw: u64) -> ProcessId {
        let pid = ProcessId::from_raw(raw);
        let dir = Arc::new(SoftPageDirectory::new());
        self.vm.register_process(pid, dir.clone()).unwrap();
        self.dirs.lock().unwrap().insert(pid, dir);
        self.esp.lock().unwrap().insert(pid, STACK_TOP);
        pid
    }

    pub fn dir(&self, pid: ProcessId) -> Arc<SoftPageDirectory> {
        self.dirs.lock().unwrap()[&pid].clone()
    }

    pub fn set_esp(&self, pid: ProcessId, esp: u64) {
        self.esp.lock().unwrap().insert(pid, esp);
    }

    fn esp(&self, pid: ProcessId) -> u64 {
        self.esp.lock().unwrap()[&pid]
    }

    /// Raises a not-present fault from user mode.
    pub fn fault(&self, pid: ProcessId, addr: u64, write: bool, esp: u64) -> FaultOutcome {
        self.vm.resolve_fault(
            pid,
            FaultInfo {
                addr,
                not_present: true,
                write,
                user: true,
                esp,
            },
        )
    }

    pub fn read(&self, pid: ProcessId, addr: u64) -> Result<u8, FaultOutcome> {
        self.access(pid, addr, false, |page, offset| page[offset])
    }

    pub fn write(&self, pid: ProcessId, addr: u64, value: u8) -> Result<(), FaultOutcome> {
        self.access(pid, addr, true, |page, offset| page[offset] = value)
    }

    fn access<R>(
        &self,
        pid: ProcessId,
        addr: u64,
        write: bool,
        f: impl Fn(&mut PageBuf, usize) -> R,
    ) -> Result<R, FaultOutcome> {
        let dir = self.dir(pid);
        let vaddr = VirtAddr::new(addr);
        let upage = page_round_down(vaddr);
        let offset = page_offset(vaddr);

        for _ in 0..MAX_FAULTS_PER_ACCESS {
            let result = dir.access(upage, write, |frame| {
                let mut page = self.pool.contents(frame);
                f(&mut **page, offset)
            });

            let not_present = match result {
                Ok(value) => return Ok(value),
                Err(Access::NotPresent) => true,
                Err(Access::ProtectionViolation) => false,
            };

            let info = FaultInfo {
                addr,
                not_present,
                write,
                user: true,
                esp: self.esp(pid),
            };
            match self.vm.resolve_fault(pid, info) {
                FaultOutcome::Resume => continue,
                outcome => return Err(outcome),
            }
        }
        panic!("access to {:#x} kept faulting", addr);
    }
}

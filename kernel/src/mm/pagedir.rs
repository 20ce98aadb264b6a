// Address Translation Primitive
//
// The VM core never touches hardware page tables directly. It goes through
// `PageDirectory`, one instance per process, which installs and clears
// user-virtual to frame translations and exposes the accessed/dirty bits the
// clock algorithm and write-back logic depend on.
//
// `SoftPageDirectory` is a software implementation keyed by page address and
// using x86 PTE flag bits. Hosted builds and the test suite use it as the
// process page table; the simulated MMU in the tests performs loads and
// stores through it so accessed/dirty bits behave as on real hardware.
//
// Contract notes:
// - `install` fails if the page is already present
// - `clear` drops the translation but leaves the accessed/dirty bits
//   readable until the page is installed again, so eviction can clear first
//   and ask about dirtiness afterwards

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use crate::mm::pmm::Frame;

pub trait PageDirectory: Send + Sync {
    fn install(&self, upage: VirtAddr, frame: Frame, writable: bool) -> bool;
    fn clear(&self, upage: VirtAddr);
    fn lookup_physical(&self, upage: VirtAddr) -> Option<Frame>;
    fn is_accessed(&self, upage: VirtAddr) -> bool;
    fn is_dirty(&self, upage: VirtAddr) -> bool;
    fn set_accessed(&self, upage: VirtAddr, accessed: bool);
    fn set_dirty(&self, upage: VirtAddr, dirty: bool);
}

#[derive(Debug, Clone, Copy)]
struct SoftPte {
    frame: Frame,
    flags: PageTableFlags,
}

impl SoftPte {
    fn is_present(&self) -> bool {
        self.flags.contains(PageTableFlags::PRESENT)
    }
}

/// Why a simulated user access did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    NotPresent,
    ProtectionViolation,
}

pub struct SoftPageDirectory {
    entries: Mutex<BTreeMap<u64, SoftPte>>,
    refuse_installs: AtomicBool,
}

impl SoftPageDirectory {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            refuse_installs: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent `install` fail, as if page-table memory had run out.
    pub fn set_refuse_installs(&self, refuse: bool) {
        self.refuse_installs.store(refuse, Ordering::Relaxed);
    }

    pub fn present_pages(&self) -> usize {
        self.entries.lock().values().filter(|pte| pte.is_present()).count()
    }

    /// Performs one user access the way the MMU would: on a present,
    /// permitted page it sets the accessed (and, for writes, dirty) bit and
    /// runs `f` on the frame while the translation is held stable.
    pub fn access<R>(
        &self,
        upage: VirtAddr,
        write: bool,
        f: impl FnOnce(Frame) -> R,
    ) -> Result<R, Access> {
        let mut entries = self.entries.lock();
        let pte = match entries.get_mut(&upage.as_u64()) {
            Some(pte) if pte.is_present() => pte,
            _ => return Err(Access::NotPresent),
        };

        if write && !pte.flags.contains(PageTableFlags::WRITABLE) {
            return Err(Access::ProtectionViolation);
        }

        pte.flags |= PageTableFlags::ACCESSED;
        if write {
            pte.flags |= PageTableFlags::DIRTY;
        }
        Ok(f(pte.frame))
    }

    fn update(&self, upage: VirtAddr, flag: PageTableFlags, value: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&upage.as_u64()) {
            pte.flags.set(flag, value);
        }
    }

    fn has(&self, upage: VirtAddr, flag: PageTableFlags) -> bool {
        self.entries
            .lock()
            .get(&upage.as_u64())
            .map_or(false, |pte| pte.flags.contains(flag))
    }
}

impl Default for SoftPageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectory for SoftPageDirectory {
    fn install(&self, upage: VirtAddr, frame: Frame, writable: bool) -> bool {
        if self.refuse_installs.load(Ordering::Relaxed) {
            return false;
        }

        let mut entries = self.entries.lock();
        if entries.get(&upage.as_u64()).map_or(false, |pte| pte.is_present()) {
            return false;
        }

        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        entries.insert(upage.as_u64(), SoftPte { frame, flags });
        true
    }

    fn clear(&self, upage: VirtAddr) {
        self.update(upage, PageTableFlags::PRESENT, false);
    }

    fn lookup_physical(&self, upage: VirtAddr) -> Option<Frame> {
        self.entries
            .lock()
            .get(&upage.as_u64())
            .filter(|pte| pte.is_present())
            .map(|pte| pte.frame)
    }

    fn is_accessed(&self, upage: VirtAddr) -> bool {
        self.has(upage, PageTableFlags::ACCESSED)
    }

    fn is_dirty(&self, upage: VirtAddr) -> bool {
        self.has(upage, PageTableFlags::DIRTY)
    }

    fn set_accessed(&self, upage: VirtAddr, accessed: bool) {
        self.update(upage, PageTableFlags::ACCESSED, accessed);
    }

    fn set_dirty(&self, upage: VirtAddr, dirty: bool) {
        self.update(upage, PageTableFlags::DIRTY, dirty);
    }
}

// Virtual Memory Configuration
//
// Tunables for the user address-space layout. Everything that depends on
// the size of physical memory or of the swap partition is decided by whoever
// builds the `FramePool` and `SwapArea`; this only describes where user
// space ends and how far the stack may grow down from there.

use x86_64::VirtAddr;

pub const PAGE_SIZE: usize = 4096;

/// Top of user virtual memory; kernel space starts here.
pub const DEFAULT_USER_TOP: u64 = 0xC000_0000;

/// Hard limit on stack size, measured down from `user_top`.
pub const DEFAULT_MAX_STACK_SIZE: u64 = 1 << 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub user_top: u64,
    pub max_stack_size: u64,
}

impl VmConfig {
    pub const fn new() -> Self {
        Self {
            user_top: DEFAULT_USER_TOP,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
        }
    }

    pub const fn with_user_top(mut self, user_top: u64) -> Self {
        self.user_top = user_top;
        self
    }

    pub const fn with_max_stack_size(mut self, max_stack_size: u64) -> Self {
        self.max_stack_size = max_stack_size;
        self
    }

    pub fn user_top_addr(&self) -> VirtAddr {
        VirtAddr::new(self.user_top)
    }

    /// Lowest address the stack may ever grow down to.
    pub fn stack_floor(&self) -> u64 {
        self.user_top.saturating_sub(self.max_stack_size)
    }

    /// True for any address below the start of kernel space, null included.
    pub fn is_user_vaddr(&self, addr: VirtAddr) -> bool {
        addr.as_u64() < self.user_top
    }

    /// True if `upage` lies in the region reserved for stack growth.
    pub fn in_stack_region(&self, upage: VirtAddr) -> bool {
        upage.as_u64() >= self.stack_floor() && upage.as_u64() < self.user_top
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub fn page_round_down(addr: VirtAddr) -> VirtAddr {
    addr.align_down(PAGE_SIZE as u64)
}

pub fn page_offset(addr: VirtAddr) -> usize {
    (addr.as_u64() % PAGE_SIZE as u64) as usize
}

pub fn is_page_aligned(addr: VirtAddr) -> bool {
    addr.is_aligned(PAGE_SIZE as u64)
}

pub fn pages_for(bytes: u64) -> u64 {
    (bytes + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64
}

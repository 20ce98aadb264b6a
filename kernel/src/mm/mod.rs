// Memory Management Subsystem
//
// Demand-paged virtual memory for user processes. User pages are backed
// lazily by executable segments, by anonymous stack growth, or by
// memory-mapped files, and a fixed pool of physical frames is shared among
// all processes through clock eviction and a swap store.
//
// Layering (leaves first):
// - `bitmap`, `pmm`: frame pool and its allocator
// - `pagedir`, `swap`, `file`: collaborators consumed through traits
//   (address translation, swap store, backing files and the FS lock)
// - `spt`: supplemental page table entries and their arena
// - `frame`: frame table and clock eviction
// - `addrspace`, `vm`: per-process state and the `VmManager` owning the
//   VM lock
// - `fault`, `mmap`, `loader`, `pin`: operations exposed to the rest of the
//   kernel (fault entry, mapping system calls, program loading, system-call
//   buffer pinning)
//
// Failure model:
// - Recoverable errors come back as `VmError`
// - Faults resolve to `FaultOutcome`, never to an error the caller unwinds
// - Conditions the kernel cannot survive (swap exhausted, every frame
//   pinned) go through `halt`

pub mod addrspace;
pub mod bitmap;
pub mod fault;
pub mod file;
pub mod frame;
pub mod loader;
pub mod mmap;
pub mod pagedir;
pub mod pin;
pub mod pmm;
pub mod spt;
pub mod swap;
pub mod vm;

#[cfg(test)]
pub(crate) mod testkit;
#[cfg(test)]
mod tests_prop;

pub use addrspace::{MapId, ProcessId};
pub use fault::{FaultInfo, FaultOutcome, EXIT_ERROR};
pub use file::{BackingFile, FileHandle, FsLock};
pub use loader::SegmentHeader;
pub use pagedir::{PageDirectory, SoftPageDirectory};
pub use pmm::{Frame, FramePool};
pub use swap::{RamDisk, SwapArea, SwapDevice, SwapSlot};
pub use vm::{PageInfo, VmManager, VmStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    InvalidAddress,
    Unaligned,
    AlreadyMapped,
    NotMapped,
    StackRegion,
    StackOverflow,
    ProtectionViolation,
    EmptyFile,
    ReopenFailed,
    NoSuchProcess,
    ProcessExists,
    InstallFailed,
    ShortRead,
    InvalidSegment,
}

/// Stops the kernel after logging `reason`. Used only for states the VM
/// cannot recover from.
pub(crate) fn halt(origin: &str, reason: &str) -> ! {
    crate::log_panic!(origin, "{}", reason);
    panic!("{}: {}", origin, reason);
}

// Demand-paged virtual memory core
//
// Library root. The crate is freestanding (`no_std` + `alloc`) so it can be
// linked into a kernel image; the host test build links `std` so the engine
// can be driven by ordinary unit tests.
//
// Bring-up order for an embedding kernel:
// - Install a log sink and tick clock (`log::set_sink`, `log::set_clock`)
// - Build the user `FramePool` and the `SwapArea` over the swap partition
// - Create one `VmManager` with the kernel's file-system lock
// - Per process: `register_process`, `load_segment` for each loadable
//   segment, `setup_stack`; route #PF to `resolve_fault`; call
//   `release_all` on exit
//
// Public interface:
// - `mm::VmManager` and the types it exchanges with the rest of the kernel
// - `config::VmConfig` tunables
// - Logging macros (`log_debug!` .. `log_panic!`)

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod log;
pub mod config;
pub mod mm;

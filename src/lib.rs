//! ParyantaOS demand-paged virtual memory.
//!
//! User pages are registered lazily and brought in on first touch. File
//! pages that are mapped shared by several processes (program text, shared
//! `mmap`s) are deduplicated so that one physical frame serves all of them.
//! When physical memory runs out a victim frame is evicted: shared pages
//! are dropped or written back, private pages go to swap.
//!
//! # Lock order
//!
//! Locks are always taken in this order:
//!
//! 1. process lock ([`process::AddressSpace`])
//! 2. registry lock ([`vm::ActiveRegistry`])
//! 3. registry-entry lock ([`vm::ActiveEntry`])
//! 4. frame-table lock ([`vm::FrameTable`])
//! 5. frame lock ([`vm::Frame`])
//! 6. global file-system lock ([`fs::FILESYS_LOCK`])
//!
//! Leaf locks never have another VM lock taken under them: a mapping's
//! frame slot, a page's eviction state, the string pool, page-directory
//! internals, the swap device and per-file handles. The frame-table lock is
//! never held across file I/O; eviction only `try_lock`s frames under it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod fs;
pub mod memory;
pub mod process;
pub mod serial;
pub mod vm;

#[cfg(test)]
mod testing;

use alloc::sync::Arc;
use bootloader_api::info::MemoryRegion;
use bootloader_api::BootInfo;
use spin::Once;
use x86_64::VirtAddr;

pub use config::{VmConfig, PAGE_SIZE};
pub use error::VmError;
pub use process::{AddressSpace, MapFlags, MmapId, PageMapping, Pid};
pub use vm::{Vm, VmStats};

static VM: Once<Arc<Vm>> = Once::new();

/// Bring up logging, the user frame pool and the global [`Vm`]. Later calls
/// return the instance built by the first.
///
/// # Safety
/// Same contract as [`memory::init`].
pub unsafe fn init(
    config: VmConfig,
    regions: &[MemoryRegion],
    phys_offset: VirtAddr,
    filesystem: Arc<dyn fs::FileSystem>,
    swap: Option<Arc<dyn vm::SwapDevice>>,
) -> &'static Arc<Vm> {
    VM.call_once(|| {
        serial::init(config.log_level);
        let phys = unsafe { memory::init(regions, phys_offset) };
        Vm::new(config, phys, filesystem, swap)
    })
}

/// [`init`] from the bootloader's hand-off.
pub fn init_from_boot_info(
    boot_info: &'static BootInfo,
    config: VmConfig,
    filesystem: Arc<dyn fs::FileSystem>,
    swap: Option<Arc<dyn vm::SwapDevice>>,
) -> &'static Arc<Vm> {
    VM.call_once(|| {
        serial::init(config.log_level);
        let phys = memory::init_from_boot_info(boot_info);
        Vm::new(config, phys, filesystem, swap)
    })
}

/// The global VM, once initialized.
pub fn vm() -> Option<&'static Arc<Vm>> {
    VM.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HostArena, MemFs};

    #[test]
    fn init_is_idempotent() {
        let arena = HostArena::new(4);
        let regions = arena.regions();
        let config = VmConfig::default().with_frame_limit(2);

        let first = unsafe { init(config, &regions, VirtAddr::new(0), MemFs::new(), None) };
        let second = unsafe { init(config, &regions, VirtAddr::new(0), MemFs::new(), None) };
        assert!(Arc::ptr_eq(first, second));
        assert!(Arc::ptr_eq(first, vm().unwrap()));
        assert_eq!(first.config().frame_limit, Some(2));
    }
}

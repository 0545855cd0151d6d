//! Physical memory for user pages.
//!
//! Provides:
//! - The [`FrameSource`] contract the frame table allocates from
//! - A region allocator fed by the bootloader memory map
//! - Page-directory access for per-process hardware page tables
//!
//! Frame contents are reached through the bootloader's linear map of all
//! physical memory: frame `p` lives at virtual `physical_memory_offset + p`.

pub mod frame_allocator;
pub mod page_dir;

use alloc::sync::Arc;
use bootloader_api::info::{MemoryRegion, MemoryRegionKind};
use bootloader_api::BootInfo;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::PAGE_SIZE;

pub use frame_allocator::RegionFrameAllocator;
pub use page_dir::{OffsetPageDirectory, PageDirectory};

/// A source of whole physical frames.
pub trait FrameSource: Send + Sync {
    /// Hand out one zero-filled frame, or `None` when exhausted.
    fn alloc_zeroed(&self) -> Option<PhysAddr>;
    /// Return a frame obtained from [`FrameSource::alloc_zeroed`].
    fn free(&self, frame: PhysAddr);
}

/// Frame source plus the offset at which physical memory is mapped.
#[derive(Clone)]
pub struct PhysMemory {
    source: Arc<dyn FrameSource>,
    offset: VirtAddr,
}

impl PhysMemory {
    pub fn new(source: Arc<dyn FrameSource>, offset: VirtAddr) -> Self {
        PhysMemory { source, offset }
    }

    /// Virtual address where physical address 0 is mapped.
    pub fn offset(&self) -> VirtAddr {
        self.offset
    }

    pub fn alloc_zeroed(&self) -> Option<PhysAddr> {
        self.source.alloc_zeroed()
    }

    pub fn free(&self, frame: PhysAddr) {
        self.source.free(frame)
    }

    /// Byte view of one frame.
    ///
    /// # Safety
    /// The caller must own the frame (frame lock held, or the frame is not
    /// yet visible to anyone else) for as long as the slice lives.
    pub unsafe fn page_mut(&self, frame: PhysAddr) -> &mut [u8] {
        let virt = self.offset + frame.as_u64();
        unsafe { core::slice::from_raw_parts_mut(virt.as_mut_ptr::<u8>(), PAGE_SIZE) }
    }

    /// Zero one frame.
    ///
    /// # Safety
    /// Same ownership requirement as [`PhysMemory::page_mut`].
    pub unsafe fn zero(&self, frame: PhysAddr) {
        unsafe { self.page_mut(frame) }.fill(0);
    }
}

/// Build the user frame pool from a memory map.
///
/// # Safety
/// Every `Usable` region must be unused by anything else, and
/// `phys_offset` must map all of physical memory.
pub unsafe fn init(regions: &[MemoryRegion], phys_offset: VirtAddr) -> PhysMemory {
    let allocator = unsafe { RegionFrameAllocator::new(regions, phys_offset) };

    let usable_frames = regions
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::Usable)
        .map(|r| (r.end - r.start) / PAGE_SIZE as u64)
        .sum::<u64>();
    log::info!(
        "[MEM] Frame allocator initialized ({} usable frames, {} KiB)",
        usable_frames,
        usable_frames * PAGE_SIZE as u64 / 1024
    );

    PhysMemory::new(Arc::new(allocator), phys_offset)
}

/// Build the user frame pool from the bootloader's hand-off.
pub fn init_from_boot_info(boot_info: &'static BootInfo) -> PhysMemory {
    let phys_mem_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("bootloader must map physical memory");

    // The bootloader only reports regions it did not use itself.
    unsafe { init(&boot_info.memory_regions, VirtAddr::new(phys_mem_offset)) }
}

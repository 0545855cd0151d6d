//! Physical frame allocator using the bootloader's memory map.
//!
//! Fresh frames are carved from the usable regions in order; freed frames
//! go onto a recycle stack and are handed out first.

use alloc::vec::Vec;
use bootloader_api::info::{MemoryRegion, MemoryRegionKind};
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

use super::FrameSource;
use crate::config::PAGE_SIZE;

const FRAME: u64 = PAGE_SIZE as u64;

struct RegionCursor {
    /// Usable `[start, end)` ranges, frame-aligned.
    regions: Vec<(u64, u64)>,
    region: usize,
    next: u64,
    recycled: Vec<PhysAddr>,
    in_use: usize,
}

impl RegionCursor {
    fn fresh_frame(&mut self) -> Option<PhysAddr> {
        while let Some(&(start, end)) = self.regions.get(self.region) {
            let next = self.next.max(start);
            if next + FRAME <= end {
                self.next = next + FRAME;
                return Some(PhysAddr::new(next));
            }
            self.region += 1;
        }
        None
    }
}

/// A frame allocator that yields usable frames from the bootloader memory map.
pub struct RegionFrameAllocator {
    phys_offset: VirtAddr,
    cursor: Mutex<RegionCursor>,
}

impl RegionFrameAllocator {
    /// Create a new frame allocator from the bootloader memory map.
    ///
    /// # Safety
    /// The caller must guarantee that the memory map is valid, that all
    /// `Usable` regions are truly unused and that `phys_offset` maps them.
    pub unsafe fn new(memory_regions: &[MemoryRegion], phys_offset: VirtAddr) -> Self {
        let regions = memory_regions
            .iter()
            .filter(|r| r.kind == MemoryRegionKind::Usable)
            .map(|r| {
                let start = (r.start + FRAME - 1) & !(FRAME - 1);
                let end = r.end & !(FRAME - 1);
                (start, end)
            })
            .filter(|(start, end)| start < end)
            .collect();

        RegionFrameAllocator {
            phys_offset,
            cursor: Mutex::new(RegionCursor {
                regions,
                region: 0,
                next: 0,
                recycled: Vec::new(),
                in_use: 0,
            }),
        }
    }

    /// Frames currently handed out.
    pub fn in_use(&self) -> usize {
        self.cursor.lock().in_use
    }
}

impl FrameSource for RegionFrameAllocator {
    fn alloc_zeroed(&self) -> Option<PhysAddr> {
        let frame = {
            let mut cursor = self.cursor.lock();
            let frame = match cursor.recycled.pop() {
                Some(frame) => frame,
                None => cursor.fresh_frame()?,
            };
            cursor.in_use += 1;
            frame
        };

        let virt = self.phys_offset + frame.as_u64();
        unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
        Some(frame)
    }

    fn free(&self, frame: PhysAddr) {
        debug_assert!(frame.is_aligned(FRAME));
        let mut cursor = self.cursor.lock();
        cursor.in_use -= 1;
        cursor.recycled.push(frame);
    }
}

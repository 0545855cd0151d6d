//! Per-process hardware page tables.
//!
//! The VM core only needs five primitives from a page directory; the
//! kernel implementation drives an `x86_64::OffsetPageTable` whose tables
//! live in frames from the same pool as user pages.

use spin::Mutex;
use x86_64::structures::paging::mapper::{MapperFlush, Translate, TranslateResult};
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
};
use x86_64::PhysAddr;

use super::PhysMemory;

/// Hardware page-table operations used by the VM core.
///
/// Implementations synchronize internally; the VM core may call them while
/// holding a frame lock.
pub trait PageDirectory: Send + Sync {
    /// Map `page` to `frame`. Returns false if the mapping could not be
    /// created (page already present, no memory for intermediate tables).
    fn install(&self, page: Page, frame: PhysAddr, writable: bool) -> bool;
    /// Remove the mapping for `page`, if any.
    fn clear(&self, page: Page);
    /// Whether the hardware recorded a write to `page`.
    fn is_dirty(&self, page: Page) -> bool;
    /// Whether the hardware recorded an access to `page`.
    fn is_accessed(&self, page: Page) -> bool;
    /// Set or clear the accessed bit (second-chance bookkeeping).
    fn set_accessed(&self, page: Page, accessed: bool);
}

/// Hands page-table frames to the mapper.
struct TableFrames<'a>(&'a PhysMemory);

unsafe impl FrameAllocator<Size4KiB> for TableFrames<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        self.0.alloc_zeroed().map(PhysFrame::containing_address)
    }
}

#[cfg(target_os = "none")]
fn finish(flush: MapperFlush<Size4KiB>) {
    flush.flush();
}

// Only the active address space has TLB entries, and host builds never run
// with these tables loaded.
#[cfg(not(target_os = "none"))]
fn finish(flush: MapperFlush<Size4KiB>) {
    flush.ignore();
}

/// A 4-level page table reached through the physical memory offset.
pub struct OffsetPageDirectory {
    mapper: Mutex<OffsetPageTable<'static>>,
    root: PhysFrame,
    phys: PhysMemory,
}

impl OffsetPageDirectory {
    /// Allocate an empty top-level table.
    pub fn new(phys: PhysMemory) -> Option<Self> {
        let root = phys.alloc_zeroed()?;
        let virt = phys.offset() + root.as_u64();
        let table: &'static mut PageTable = unsafe { &mut *virt.as_mut_ptr::<PageTable>() };
        let mapper = unsafe { OffsetPageTable::new(table, phys.offset()) };

        Some(OffsetPageDirectory {
            mapper: Mutex::new(mapper),
            root: PhysFrame::containing_address(root),
            phys,
        })
    }

    /// Level-4 frame, for loading into CR3 on a context switch.
    pub fn root(&self) -> PhysFrame {
        self.root
    }

    /// Frame currently mapped at `page`.
    pub fn translate(&self, page: Page) -> Option<PhysAddr> {
        self.mapper.lock().translate_addr(page.start_address())
    }

    fn flags(&self, page: Page) -> Option<PageTableFlags> {
        match self.mapper.lock().translate(page.start_address()) {
            TranslateResult::Mapped { flags, .. } => Some(flags),
            _ => None,
        }
    }

    fn update(&self, page: Page, f: impl FnOnce(PageTableFlags) -> PageTableFlags) {
        let mut mapper = self.mapper.lock();
        if let TranslateResult::Mapped { flags, .. } = mapper.translate(page.start_address()) {
            if let Ok(flush) = unsafe { mapper.update_flags(page, f(flags)) } {
                finish(flush);
            }
        }
    }

    /// Set the accessed and (for writes) dirty bits the way the MMU would.
    #[cfg(test)]
    pub fn simulate_access(&self, page: Page, write: bool) {
        self.update(page, |flags| {
            let mut flags = flags | PageTableFlags::ACCESSED;
            if write {
                flags |= PageTableFlags::DIRTY;
            }
            flags
        });
    }
}

impl PageDirectory for OffsetPageDirectory {
    fn install(&self, page: Page, frame: PhysAddr, writable: bool) -> bool {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        let frame = PhysFrame::containing_address(frame);
        let mut tables = TableFrames(&self.phys);

        let mut mapper = self.mapper.lock();
        match unsafe { mapper.map_to(page, frame, flags, &mut tables) } {
            Ok(flush) => {
                finish(flush);
                true
            }
            Err(err) => {
                log::warn!("[PGDIR] map {:?} failed: {:?}", page.start_address(), err);
                false
            }
        }
    }

    fn clear(&self, page: Page) {
        if let Ok((_, flush)) = self.mapper.lock().unmap(page) {
            finish(flush);
        }
    }

    fn is_dirty(&self, page: Page) -> bool {
        self.flags(page)
            .map_or(false, |f| f.contains(PageTableFlags::DIRTY))
    }

    fn is_accessed(&self, page: Page) -> bool {
        self.flags(page)
            .map_or(false, |f| f.contains(PageTableFlags::ACCESSED))
    }

    fn set_accessed(&self, page: Page, accessed: bool) {
        self.update(page, |flags| {
            if accessed {
                flags | PageTableFlags::ACCESSED
            } else {
                flags - PageTableFlags::ACCESSED
            }
        });
    }
}

/// Free `table` and every lower-level table below it. Leaf frames belong
/// to the frame table and are left alone.
unsafe fn free_tables(phys: &PhysMemory, table: PhysAddr, level: u8) {
    if level > 1 {
        let virt = phys.offset() + table.as_u64();
        let entries = unsafe { &*virt.as_ptr::<PageTable>() };
        for entry in entries.iter() {
            if !entry.is_unused() && !entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                unsafe { free_tables(phys, entry.addr(), level - 1) };
            }
        }
    }
    phys.free(table);
}

impl Drop for OffsetPageDirectory {
    fn drop(&mut self) {
        unsafe { free_tables(&self.phys, self.root.start_address(), 4) };
    }
}

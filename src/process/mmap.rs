//! Memory-mapped files.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use x86_64::structures::paging::Page;
use x86_64::VirtAddr;

use super::{AddressSpace, Fd, PageMapping};
use crate::config::PAGE_SIZE;
use crate::error::VmError;
use crate::fs::{self, File};
use crate::vm::{FilePage, PageContent};

bitflags! {
    /// How a file is mapped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Pages are writable by the process.
        const WRITABLE = 1 << 0;
        /// Pages share one frame with every other mapping of the same file
        /// page; writes reach the file.
        const SHARED = 1 << 1;
    }
}

/// Per-process mapping identifier, as returned to user programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MmapId(u32);

impl MmapId {
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for MmapId {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "mmap#{}", self.0)
    }
}

/// The consecutive pages created by one `map_file` call.
pub struct MmapRegion {
    id: MmapId,
    start: Page,
    flags: MapFlags,
    pages: Vec<Arc<PageMapping>>,
}

impl MmapRegion {
    pub fn id(&self) -> MmapId {
        self.id
    }

    pub fn start(&self) -> VirtAddr {
        self.start.start_address()
    }

    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn mappings(&self) -> &[Arc<PageMapping>] {
        &self.pages
    }

    pub(super) fn forget(&mut self, mapping: &Arc<PageMapping>) {
        self.pages.retain(|m| !Arc::ptr_eq(m, mapping));
    }
}

impl AddressSpace {
    /// Map the file open as `fd` at `vaddr`, shared and writable.
    pub fn map_file(&self, fd: Fd, vaddr: VirtAddr) -> Result<MmapId, VmError> {
        self.map_file_with(fd, vaddr, MapFlags::WRITABLE | MapFlags::SHARED)
    }

    /// Map the whole file open as `fd` at `vaddr`, one page per
    /// `PAGE_SIZE` bytes, the last page zero-padded past end of file.
    /// Rejections leave the address space untouched.
    pub fn map_file_with(&self, fd: Fd, vaddr: VirtAddr, flags: MapFlags) -> Result<MmapId, VmError> {
        if vaddr.as_u64() == 0 {
            return Err(VmError::NullAddress);
        }
        let start = Page::from_start_address(vaddr).map_err(|_| VmError::Misaligned)?;
        let path = self.descriptors.path(fd).ok_or(VmError::BadDescriptor)?;
        let path = self.vm.paths().intern(&path)?;

        // Every page gets its own handle on the descriptor's open file.
        let page_size = PAGE_SIZE as u64;
        let (length, handles) = {
            let _fs = fs::lock();
            let file = self.descriptors.reopen(fd).ok_or(VmError::BadDescriptor)?;
            let length = file.length();
            if length == 0 {
                return Err(VmError::EmptyFile);
            }
            let count = (length + page_size - 1) / page_size;
            let end = vaddr
                .as_u64()
                .checked_add(count * page_size)
                .ok_or(VmError::NotUserAddress)?;
            if end > self.vm.config().user_top.as_u64() {
                return Err(VmError::NotUserAddress);
            }
            let handles: Vec<Box<dyn File>> = (0..count).map(|_| file.reopen()).collect();
            (length, handles)
        };

        let count = handles.len() as u64;
        let files: Vec<FilePage> = handles
            .into_iter()
            .enumerate()
            .map(|(index, file)| {
                let offset = index as u64 * page_size;
                let zero_fill = (offset + page_size).saturating_sub(length) as usize;
                FilePage::with_handle(path.clone(), offset, zero_fill, file)
            })
            .collect();

        let mut inner = self.inner.lock();
        if inner.exited {
            return Err(VmError::ProcessExited);
        }
        if inner.pages.range(start..start + count).next().is_some() {
            return Err(VmError::Overlap);
        }

        let writable = flags.contains(MapFlags::WRITABLE);
        let mut pages = Vec::with_capacity(files.len());
        for (page, file) in (0..count).map(|i| start + i).zip(files) {
            let content = if flags.contains(MapFlags::SHARED) {
                let registry = if writable {
                    self.vm.writable()
                } else {
                    self.vm.readonly()
                };
                PageContent::shared(registry.acquire(file))
            } else {
                PageContent::private_file(file)
            };
            // Range checked free above, under the same lock.
            pages.push(self.insert(&mut inner, page, writable, content)?);
        }

        let id = MmapId(inner.next_mmap);
        inner.next_mmap += 1;
        log::debug!(
            "[MMAP] {}: {} {} at {:#x} ({} pages, {:?})",
            self.pid,
            id,
            path,
            vaddr.as_u64(),
            count,
            flags
        );
        inner.regions.insert(
            id,
            MmapRegion {
                id,
                start,
                flags,
                pages,
            },
        );
        Ok(id)
    }

    /// Remove every page of region `id`. False for an unknown id.
    pub fn unmap_file(&self, id: MmapId) -> bool {
        let mut inner = self.inner.lock();
        let Some(region) = inner.regions.remove(&id) else {
            return false;
        };
        for mapping in region.pages.iter() {
            inner.pages.remove(&mapping.page());
            mapping.destroy(self.vm.frames());
        }
        log::debug!("[MMAP] {}: unmapped {}", self.pid, id);
        true
    }

    /// Pages in region `id`.
    pub fn region_len(&self, id: MmapId) -> Option<usize> {
        self.inner.lock().regions.get(&id).map(|r| r.pages.len())
    }
}

/// System-call return value for an mmap result.
pub fn mmap_result_code(result: Result<MmapId, VmError>) -> i32 {
    match result {
        Ok(id) => id.as_u32() as i32,
        Err(err) => {
            log::debug!("[MMAP] rejected: {}", err);
            -1
        }
    }
}

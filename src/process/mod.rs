//! Per-process address spaces.
//!
//! An [`AddressSpace`] maps user pages to [`PageMapping`]s. Mappings are
//! registered when a program is loaded or a file is mapped, and activated
//! lazily: the first touch of a page faults into [`AddressSpace::handle_fault`],
//! which finds or loads a frame and installs it in the hardware page table.

pub mod mmap;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use x86_64::structures::paging::Page;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::PAGE_SIZE;
use crate::error::VmError;
use crate::fs::File;
use crate::memory::PageDirectory;
use crate::vm::{FilePage, Frame, FrameTable, PageContent, Vm};

pub use mmap::{mmap_result_code, MapFlags, MmapId, MmapRegion};

/// Unique process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u64);

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

impl Pid {
    /// Allocate a fresh identifier.
    pub fn next() -> Self {
        Pid(NEXT_PID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Process#{}", self.0)
    }
}

/// A file descriptor number.
pub type Fd = i32;

/// The process's open-file table, as far as `mmap` needs it.
pub trait Descriptors: Send + Sync {
    /// Path the file open as `fd` was opened by. Names its pages for sharing.
    fn path(&self, fd: Fd) -> Option<String>;
    /// Fresh handle on the file open as `fd`. Called with the file-system
    /// lock held.
    fn reopen(&self, fd: Fd) -> Option<Box<dyn File>>;
}

/// One virtual page of one process.
pub struct PageMapping {
    pid: Pid,
    page: Page,
    writable: bool,
    pagedir: Arc<dyn PageDirectory>,
    content: PageContent,
    /// Leaf lock. `Some` exactly while the page is installed.
    frame: Mutex<Option<Arc<Frame>>>,
}

impl PageMapping {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn page(&self) -> Page {
        self.page
    }

    pub fn vaddr(&self) -> VirtAddr {
        self.page.start_address()
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn pagedir(&self) -> &dyn PageDirectory {
        &*self.pagedir
    }

    pub fn content(&self) -> &PageContent {
        &self.content
    }

    pub fn is_mapped(&self) -> bool {
        self.frame.lock().is_some()
    }

    pub fn frame(&self) -> Option<Arc<Frame>> {
        self.frame.lock().clone()
    }

    /// Called by the frame table after it removed this page's PTE.
    pub(crate) fn forget_frame(&self, frame: &Arc<Frame>) {
        let mut slot = self.frame.lock();
        if slot.as_ref().map_or(false, |f| Arc::ptr_eq(f, frame)) {
            *slot = None;
        }
    }

    /// Unmapped -> Mapped.
    fn activate(self: &Arc<Self>, frames: &FrameTable) -> Result<PhysAddr, VmError> {
        assert!(
            !self.is_mapped(),
            "{}: page {:#x} activated twice",
            self.pid,
            self.vaddr().as_u64()
        );

        let frame = match &self.content {
            PageContent::SharedReadOnlyFile(active) | PageContent::SharedWritableFile(active) => {
                active.load_page()?
            }
            PageContent::PrivateFileBacked(file, state) => match frames.swap_in(state)? {
                Some(frame) => frame,
                None => file.load(frames)?,
            },
            PageContent::Anonymous(state) => match frames.swap_in(state)? {
                Some(frame) => frame,
                None => frames.allocate()?,
            },
        };

        if !self.pagedir.install(self.page, frame.paddr(), self.writable) {
            if self.content.is_shared() {
                frames.unpin(&frame);
            } else {
                frames.release(&frame, None);
            }
            return Err(VmError::InstallFailed);
        }

        if let Some(state) = self.content.eviction() {
            frames.finish_swap_in(state);
        }
        *self.frame.lock() = Some(frame.clone());
        frames.attach_mapping(&frame, self);

        log::trace!(
            "[VM] {}: mapped {:#x} -> {:#x} {:?}",
            self.pid,
            self.vaddr().as_u64(),
            frame.paddr().as_u64(),
            self.content
        );
        Ok(frame.paddr())
    }

    /// Unmap and drop any frame or swap slot owned by this page. The
    /// content's own resources go with the last `Arc`.
    fn destroy(&self, frames: &FrameTable) {
        let frame = self.frame.lock().take();
        if let Some(frame) = frame {
            frames.detach_mapping(&frame, self);
            if !self.content.is_shared() {
                frames.release(&frame, None);
            }
        }
        if let Some(state) = self.content.eviction() {
            frames.discard_swap(state);
        }
    }
}

impl core::fmt::Debug for PageMapping {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "(vaddr={:#x}, writable={}, mapped={}, content={:?})",
            self.vaddr().as_u64(),
            self.writable,
            self.is_mapped(),
            self.content
        )
    }
}

struct SpaceInner {
    pages: BTreeMap<Page, Arc<PageMapping>>,
    regions: BTreeMap<MmapId, MmapRegion>,
    next_mmap: u32,
    exited: bool,
    user_stack: Option<VirtAddr>,
}

/// Supplemental page table of one process.
pub struct AddressSpace {
    pid: Pid,
    vm: Arc<Vm>,
    pagedir: Arc<dyn PageDirectory>,
    descriptors: Arc<dyn Descriptors>,
    /// Process lock. First in the VM lock order.
    inner: Mutex<SpaceInner>,
}

impl AddressSpace {
    pub fn new(
        pid: Pid,
        vm: Arc<Vm>,
        pagedir: Arc<dyn PageDirectory>,
        descriptors: Arc<dyn Descriptors>,
    ) -> Self {
        AddressSpace {
            pid,
            vm,
            pagedir,
            descriptors,
            inner: Mutex::new(SpaceInner {
                pages: BTreeMap::new(),
                regions: BTreeMap::new(),
                next_mmap: 0,
                exited: false,
                user_stack: None,
            }),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn pagedir(&self) -> &Arc<dyn PageDirectory> {
        &self.pagedir
    }

    /// Registered pages.
    pub fn len(&self) -> usize {
        self.inner.lock().pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_exited(&self) -> bool {
        self.inner.lock().exited
    }

    /// Register a page backed by `file`. Shared pages go through the
    /// read-only or writable registry; private pages get their own copy.
    pub fn register_file_backed(
        &self,
        vaddr: VirtAddr,
        file: FilePage,
        readonly: bool,
        shared: bool,
    ) -> Result<Arc<PageMapping>, VmError> {
        let page = self.user_page(vaddr)?;
        let content = if shared {
            let registry = if readonly {
                self.vm.readonly()
            } else {
                self.vm.writable()
            };
            PageContent::shared(registry.acquire(file))
        } else {
            PageContent::private_file(file)
        };

        let mut inner = self.inner.lock();
        self.insert(&mut inner, page, !readonly, content)
    }

    /// Register a writable zero-filled page.
    pub fn register_anonymous(&self, vaddr: VirtAddr) -> Result<Arc<PageMapping>, VmError> {
        let page = self.user_page(vaddr)?;
        let mut inner = self.inner.lock();
        self.insert(&mut inner, page, true, PageContent::anonymous())
    }

    /// Bring the page at `vaddr` into memory and install it.
    ///
    /// # Panics
    /// If the page is already installed.
    pub fn activate(&self, vaddr: VirtAddr) -> Result<PhysAddr, VmError> {
        let inner = self.inner.lock();
        let mapping = inner
            .pages
            .get(&Page::containing_address(vaddr))
            .ok_or(VmError::NotMapped)?;
        mapping.activate(self.vm.frames())
    }

    /// Page-fault entry: like [`AddressSpace::activate`], but a fault on a
    /// present page is a protection violation rather than a bug.
    pub fn handle_fault(&self, vaddr: VirtAddr) -> Result<PhysAddr, VmError> {
        let inner = self.inner.lock();
        let mapping = inner
            .pages
            .get(&Page::containing_address(vaddr))
            .ok_or(VmError::NotMapped)?;
        if mapping.is_mapped() {
            log::debug!(
                "[VM] {}: protection fault at {:#x}",
                self.pid,
                vaddr.as_u64()
            );
            return Err(VmError::AccessViolation);
        }
        mapping.activate(self.vm.frames())
    }

    /// Mapping covering `vaddr`.
    pub fn find(&self, vaddr: VirtAddr) -> Option<Arc<PageMapping>> {
        self.inner
            .lock()
            .pages
            .get(&Page::containing_address(vaddr))
            .cloned()
    }

    /// Remove one mapping. False if it is not (or no longer) registered here.
    pub fn destroy_mapping(&self, mapping: &Arc<PageMapping>) -> bool {
        let mut inner = self.inner.lock();
        let registered = inner
            .pages
            .get(&mapping.page)
            .map_or(false, |m| Arc::ptr_eq(m, mapping));
        if !registered {
            return false;
        }

        inner.pages.remove(&mapping.page);
        for region in inner.regions.values_mut() {
            region.forget(mapping);
        }
        mapping.destroy(self.vm.frames());
        true
    }

    /// Tear down the whole address space at process exit.
    ///
    /// # Panics
    /// When called a second time.
    pub fn destroy_all(&self) {
        let mut inner = self.inner.lock();
        assert!(!inner.exited, "{}: address space destroyed twice", self.pid);
        inner.exited = true;
        inner.regions.clear();

        let pages = core::mem::take(&mut inner.pages);
        for mapping in pages.values() {
            mapping.destroy(self.vm.frames());
        }
        log::debug!("[VM] {}: released {} pages", self.pid, pages.len());
    }

    /// Register and fault in the page just below the configured stack top.
    pub fn setup_stack(&self) -> Result<PhysAddr, VmError> {
        let vaddr = self.vm.config().stack_top - PAGE_SIZE as u64;
        let mapping = self.register_anonymous(vaddr)?;
        self.activate(vaddr).map_err(|err| {
            self.destroy_mapping(&mapping);
            err
        })
    }

    /// Remember the user stack pointer on entry to a system call, for faults
    /// taken in kernel mode.
    pub fn save_user_stack(&self, esp: VirtAddr) {
        self.inner.lock().user_stack = Some(esp);
    }

    pub fn take_user_stack(&self) -> Option<VirtAddr> {
        self.inner.lock().user_stack.take()
    }

    /// Log every page of this process.
    pub fn dump(&self) {
        let inner = self.inner.lock();
        log::info!(
            "[VM] {} address space ({} pages, {} mmap regions)",
            self.pid,
            inner.pages.len(),
            inner.regions.len()
        );
        for mapping in inner.pages.values() {
            log::info!("[VM]   {:?}", mapping);
        }
    }

    fn user_page(&self, vaddr: VirtAddr) -> Result<Page, VmError> {
        let page = Page::from_start_address(vaddr).map_err(|_| VmError::Misaligned)?;
        let end = vaddr
            .as_u64()
            .checked_add(PAGE_SIZE as u64)
            .ok_or(VmError::NotUserAddress)?;
        if end > self.vm.config().user_top.as_u64() {
            return Err(VmError::NotUserAddress);
        }
        Ok(page)
    }

    /// Add a mapping under the process lock. On failure `content` is
    /// dropped, releasing whatever it holds.
    fn insert(
        &self,
        inner: &mut SpaceInner,
        page: Page,
        writable: bool,
        content: PageContent,
    ) -> Result<Arc<PageMapping>, VmError> {
        if inner.exited {
            return Err(VmError::ProcessExited);
        }
        if inner.pages.contains_key(&page) {
            log::debug!(
                "[VM] {}: {:#x} already mapped",
                self.pid,
                page.start_address().as_u64()
            );
            return Err(VmError::AlreadyMapped);
        }

        let mapping = Arc::new(PageMapping {
            pid: self.pid,
            page,
            writable,
            pagedir: self.pagedir.clone(),
            content,
            frame: Mutex::new(None),
        });
        inner.pages.insert(page, mapping.clone());
        Ok(mapping)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if !self.inner.get_mut().exited {
            self.destroy_all();
        }
    }
}

//! Host doubles for the kernel services the VM core sits on.

use std::alloc::Layout;
use std::collections::BTreeMap;
use std::string::{String, ToString};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::vec::Vec;

use bootloader_api::info::{MemoryRegion, MemoryRegionKind};
use log::LevelFilter;
use x86_64::structures::paging::Page;
use x86_64::{PhysAddr, VirtAddr};

use crate::config::{VmConfig, PAGE_SIZE};
use crate::fs::{File, FileSystem, FILESYS_LOCK};
use crate::memory::{PageDirectory, PhysMemory, RegionFrameAllocator};
use crate::process::{AddressSpace, Descriptors, Fd, Pid};
use crate::vm::{Clock, SwapDevice, SwapSlot, VictimSelector, Vm};

/// Page-aligned host memory posing as physical memory, with the physical
/// memory offset at zero. Leaked so frame addresses stay valid.
pub struct HostArena {
    base: u64,
    frames: usize,
    allocator: Arc<RegionFrameAllocator>,
}

impl HostArena {
    pub fn new(frames: usize) -> Self {
        let layout = Layout::from_size_align(frames.max(1) * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) } as u64;
        assert_ne!(base, 0, "host arena allocation failed");

        let regions = usable(base, frames);
        let allocator = unsafe { RegionFrameAllocator::new(&regions, VirtAddr::new(0)) };
        HostArena {
            base,
            frames,
            allocator: Arc::new(allocator),
        }
    }

    pub fn regions(&self) -> Vec<MemoryRegion> {
        usable(self.base, self.frames)
    }

    pub fn phys(&self) -> PhysMemory {
        PhysMemory::new(self.allocator.clone(), VirtAddr::new(0))
    }

    pub fn allocator(&self) -> &RegionFrameAllocator {
        &self.allocator
    }
}

fn usable(base: u64, frames: usize) -> Vec<MemoryRegion> {
    vec![MemoryRegion {
        start: base,
        end: base + (frames * PAGE_SIZE) as u64,
        kind: MemoryRegionKind::Usable,
    }]
}

struct MemFileData {
    bytes: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

/// In-memory file system. Files have a fixed length, like the kernel's.
pub struct MemFs {
    files: Mutex<BTreeMap<String, Arc<MemFileData>>>,
    handles: Arc<AtomicUsize>,
}

impl MemFs {
    pub fn new() -> Arc<Self> {
        Arc::new(MemFs {
            files: Mutex::new(BTreeMap::new()),
            handles: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn add(&self, path: &str, bytes: &[u8]) {
        self.files.lock().unwrap().insert(
            path.to_string(),
            Arc::new(MemFileData {
                bytes: Mutex::new(bytes.to_vec()),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }),
        );
    }

    /// Shrink a file behind the VM's back.
    pub fn truncate(&self, path: &str, len: usize) {
        self.data(path).bytes.lock().unwrap().truncate(len);
    }

    pub fn contents(&self, path: &str) -> Vec<u8> {
        self.data(path).bytes.lock().unwrap().clone()
    }

    /// Read calls made against `path`.
    pub fn reads(&self, path: &str) -> usize {
        self.data(path).reads.load(Ordering::SeqCst)
    }

    /// Write calls made against `path`.
    pub fn writes(&self, path: &str) -> usize {
        self.data(path).writes.load(Ordering::SeqCst)
    }

    pub fn open_handles(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }

    fn data(&self, path: &str) -> Arc<MemFileData> {
        self.files.lock().unwrap()[path].clone()
    }
}

impl FileSystem for MemFs {
    fn open(&self, path: &str) -> Option<Box<dyn File>> {
        assert!(FILESYS_LOCK.is_locked(), "open without the file-system lock");
        let data = self.files.lock().unwrap().get(path)?.clone();
        self.handles.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(MemHandle {
            data,
            pos: 0,
            handles: self.handles.clone(),
        }))
    }
}

struct MemHandle {
    data: Arc<MemFileData>,
    pos: u64,
    handles: Arc<AtomicUsize>,
}

impl File for MemHandle {
    fn length(&self) -> u64 {
        self.data.bytes.lock().unwrap().len() as u64
    }

    fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        assert!(FILESYS_LOCK.is_locked(), "read without the file-system lock");
        self.data.reads.fetch_add(1, Ordering::SeqCst);
        let bytes = self.data.bytes.lock().unwrap();
        let start = (self.pos as usize).min(bytes.len());
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        self.pos += n as u64;
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        assert!(FILESYS_LOCK.is_locked(), "write without the file-system lock");
        self.data.writes.fetch_add(1, Ordering::SeqCst);
        let mut bytes = self.data.bytes.lock().unwrap();
        let start = (self.pos as usize).min(bytes.len());
        let n = buf.len().min(bytes.len() - start);
        bytes[start..start + n].copy_from_slice(&buf[..n]);
        self.pos += n as u64;
        n
    }

    fn reopen(&self) -> Box<dyn File> {
        assert!(FILESYS_LOCK.is_locked(), "reopen without the file-system lock");
        self.handles.fetch_add(1, Ordering::SeqCst);
        Box::new(MemHandle {
            data: self.data.clone(),
            pos: 0,
            handles: self.handles.clone(),
        })
    }
}

impl Drop for MemHandle {
    fn drop(&mut self) {
        assert!(FILESYS_LOCK.is_locked(), "close without the file-system lock");
        self.handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy)]
struct Pte {
    frame: PhysAddr,
    accessed: bool,
    dirty: bool,
}

/// Page directory whose accessed and dirty bits the test sets by hand.
pub struct MockPageDirectory {
    entries: Mutex<BTreeMap<Page, Pte>>,
    fail_installs: AtomicBool,
}

impl MockPageDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(MockPageDirectory {
            entries: Mutex::new(BTreeMap::new()),
            fail_installs: AtomicBool::new(false),
        })
    }

    pub fn set_fail_installs(&self, fail: bool) {
        self.fail_installs.store(fail, Ordering::SeqCst);
    }

    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.entries
            .lock()
            .unwrap()
            .get(&Page::containing_address(vaddr))
            .map(|pte| pte.frame)
    }

    /// What the MMU does on a user access.
    pub fn touch(&self, vaddr: VirtAddr, write: bool) {
        if let Some(pte) = self
            .entries
            .lock()
            .unwrap()
            .get_mut(&Page::containing_address(vaddr))
        {
            pte.accessed = true;
            pte.dirty |= write;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl PageDirectory for MockPageDirectory {
    fn install(&self, page: Page, frame: PhysAddr, _writable: bool) -> bool {
        if self.fail_installs.load(Ordering::SeqCst) {
            return false;
        }
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&page) {
            return false;
        }
        entries.insert(
            page,
            Pte {
                frame,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    fn clear(&self, page: Page) {
        self.entries.lock().unwrap().remove(&page);
    }

    fn is_dirty(&self, page: Page) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&page)
            .map_or(false, |pte| pte.dirty)
    }

    fn is_accessed(&self, page: Page) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&page)
            .map_or(false, |pte| pte.accessed)
    }

    fn set_accessed(&self, page: Page, accessed: bool) {
        if let Some(pte) = self.entries.lock().unwrap().get_mut(&page) {
            pte.accessed = accessed;
        }
    }
}

/// Fixed-size in-memory swap device.
pub struct MemSwap {
    slots: Mutex<Vec<Option<Vec<u8>>>>,
    reserved: Mutex<Vec<bool>>,
}

impl MemSwap {
    pub fn new(slots: usize) -> Arc<Self> {
        Arc::new(MemSwap {
            slots: Mutex::new(vec![None; slots]),
            reserved: Mutex::new(vec![false; slots]),
        })
    }

    /// Slots currently reserved.
    pub fn in_use(&self) -> usize {
        self.reserved.lock().unwrap().iter().filter(|r| **r).count()
    }
}

impl SwapDevice for MemSwap {
    fn reserve(&self) -> Option<SwapSlot> {
        let mut reserved = self.reserved.lock().unwrap();
        let index = reserved.iter().position(|r| !*r)?;
        reserved[index] = true;
        Some(SwapSlot::new(index as u64))
    }

    fn write(&self, slot: SwapSlot, page: &[u8]) {
        self.slots.lock().unwrap()[slot.index() as usize] = Some(page.to_vec());
    }

    fn read(&self, slot: SwapSlot, page: &mut [u8]) {
        let slots = self.slots.lock().unwrap();
        let data = slots[slot.index() as usize]
            .as_ref()
            .expect("read from an empty swap slot");
        page.copy_from_slice(data);
    }

    fn release(&self, slot: SwapSlot) {
        let index = slot.index() as usize;
        let mut reserved = self.reserved.lock().unwrap();
        assert!(reserved[index], "double release of swap slot {}", index);
        reserved[index] = false;
        self.slots.lock().unwrap()[index] = None;
    }
}

/// File descriptor table holding open handles from a [`MemFs`].
pub struct FdTable {
    fs: Arc<MemFs>,
    files: Mutex<BTreeMap<Fd, (String, Box<dyn File>)>>,
}

impl FdTable {
    pub fn new(fs: Arc<MemFs>) -> Arc<Self> {
        Arc::new(FdTable {
            fs,
            files: Mutex::new(BTreeMap::new()),
        })
    }

    /// Open `path`. Descriptor numbers start at 2, after the console.
    pub fn open(&self, path: &str) -> Fd {
        let _fs = FILESYS_LOCK.lock();
        let file = self.fs.open(path).expect("open of a missing file");
        let mut files = self.files.lock().unwrap();
        let fd = files.keys().next_back().map_or(2, |last| last + 1);
        files.insert(fd, (path.to_string(), file));
        fd
    }
}

impl Descriptors for FdTable {
    fn path(&self, fd: Fd) -> Option<String> {
        self.files.lock().unwrap().get(&fd).map(|(path, _)| path.clone())
    }

    fn reopen(&self, fd: Fd) -> Option<Box<dyn File>> {
        self.files.lock().unwrap().get(&fd).map(|(_, file)| file.reopen())
    }
}

impl Drop for FdTable {
    fn drop(&mut self) {
        let _fs = FILESYS_LOCK.lock();
        self.files.get_mut().unwrap().clear();
    }
}

/// A VM over a host arena, an in-memory file system and optional swap.
pub struct Testbed {
    pub arena: HostArena,
    pub fs: Arc<MemFs>,
    pub swap: Option<Arc<MemSwap>>,
    pub vm: Arc<Vm>,
}

impl Testbed {
    pub fn new(frames: usize) -> Self {
        Self::build(frames, VmConfig::default(), None, Box::new(Clock::new()))
    }

    pub fn with_swap(frames: usize, slots: usize) -> Self {
        Self::build(frames, VmConfig::default(), Some(slots), Box::new(Clock::new()))
    }

    pub fn build(
        frames: usize,
        config: VmConfig,
        swap_slots: Option<usize>,
        selector: Box<dyn VictimSelector>,
    ) -> Self {
        crate::serial::init(LevelFilter::Debug);
        let arena = HostArena::new(frames);
        let fs = MemFs::new();
        let swap = swap_slots.map(MemSwap::new);
        let vm = Vm::with_policy(
            config,
            arena.phys(),
            fs.clone(),
            swap.clone().map(|s| s as Arc<dyn SwapDevice>),
            selector,
        );
        Testbed {
            arena,
            fs,
            swap,
            vm,
        }
    }

    pub fn process(&self) -> TestProcess {
        let dir = MockPageDirectory::new();
        let fds = FdTable::new(self.fs.clone());
        let space = AddressSpace::new(Pid::next(), self.vm.clone(), dir.clone(), fds.clone());
        TestProcess { dir, fds, space }
    }
}

const RETRIES: usize = 100;

/// An address space with its page directory and fd table in reach.
pub struct TestProcess {
    pub dir: Arc<MockPageDirectory>,
    pub fds: Arc<FdTable>,
    pub space: AddressSpace,
}

impl TestProcess {
    /// A user store: set the accessed and dirty bits and write through the
    /// installed frame, faulting the page back in if it was evicted.
    pub fn write(&self, vaddr: VirtAddr, data: &[u8]) {
        let offset = (vaddr.as_u64() % PAGE_SIZE as u64) as usize;
        for _ in 0..RETRIES {
            if let Some(frame) = self.installed(vaddr) {
                self.dir.touch(vaddr, true);
                if self.space.vm().frames().write_frame(&frame, offset, data) {
                    return;
                }
            }
        }
        panic!("write to {:#x} kept missing", vaddr.as_u64());
    }

    /// Bytes of the page containing `vaddr`, faulting it in if needed.
    pub fn read(&self, vaddr: VirtAddr) -> Vec<u8> {
        for _ in 0..RETRIES {
            if let Some(frame) = self.installed(vaddr) {
                self.dir.touch(vaddr, false);
                if let Some(bytes) = self.space.vm().frames().read_frame(&frame) {
                    return bytes;
                }
            }
        }
        panic!("read of {:#x} kept missing", vaddr.as_u64());
    }

    fn installed(&self, vaddr: VirtAddr) -> Option<Arc<crate::vm::Frame>> {
        let mapping = self.space.find(vaddr).expect("access to unregistered page");
        match mapping.frame() {
            Some(frame) => Some(frame),
            None => {
                let _ = self.space.handle_fault(vaddr);
                None
            }
        }
    }
}

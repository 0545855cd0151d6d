//! Frame table: every physical frame currently backing user pages.
//!
//! A [`Frame`] is pinned from allocation until its first mapping attaches,
//! so a page being filled can never be chosen for eviction. Once a frame is
//! released or evicted it is *retired*: its physical memory belongs to
//! someone else and the stale handle only answers "not live".

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use x86_64::PhysAddr;

use super::content::{EvictionState, FrameContent};
use super::evict::{Probe, SwapDevice, SwapSlot, VictimSelector};
use super::file_page::FilePage;
use crate::error::VmError;
use crate::memory::PhysMemory;
use crate::process::PageMapping;

const EVICT_ATTEMPTS: usize = 8;

/// One physical frame.
pub struct Frame {
    paddr: PhysAddr,
    inner: Mutex<FrameInner>,
}

struct FrameInner {
    /// Recorded when a registry loads the frame or by the first attach.
    content: Option<FrameContent>,
    mappings: Vec<Weak<PageMapping>>,
    /// Sticky: hardware dirty bits folded in on every detach.
    dirty: bool,
    pins: usize,
    retired: bool,
}

impl Frame {
    fn new(paddr: PhysAddr) -> Self {
        Frame {
            paddr,
            inner: Mutex::new(FrameInner {
                content: None,
                mappings: Vec::new(),
                dirty: false,
                pins: 1,
                retired: false,
            }),
        }
    }

    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }

    /// Neither released nor evicted.
    pub fn is_live(&self) -> bool {
        !self.inner.lock().retired
    }

    pub fn mapping_count(&self) -> usize {
        self.inner.lock().mappings.len()
    }

    pub fn pins(&self) -> usize {
        self.inner.lock().pins
    }

    /// Sticky dirty flag, not counting bits still only in page tables.
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    /// Look at the frame without blocking.
    pub fn probe(&self, can_swap: bool) -> Probe {
        let Some(inner) = self.inner.try_lock() else {
            return Probe::Unevictable;
        };
        if !inner.evictable(can_swap) {
            return Probe::Unevictable;
        }
        let referenced = inner
            .live_mappings()
            .any(|m| m.pagedir().is_accessed(m.page()));
        if referenced {
            Probe::Referenced
        } else {
            Probe::Idle
        }
    }

    /// Clear the accessed bit in every mapping, if the frame is free to look at.
    pub fn clear_accessed(&self) {
        if let Some(inner) = self.inner.try_lock() {
            for m in inner.live_mappings() {
                m.pagedir().set_accessed(m.page(), false);
            }
        }
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Frame({:#x})", self.paddr.as_u64())
    }
}

impl FrameInner {
    fn live_mappings(&self) -> impl Iterator<Item = Arc<PageMapping>> + '_ {
        self.mappings.iter().filter_map(Weak::upgrade)
    }

    fn evictable(&self, can_swap: bool) -> bool {
        if self.retired || self.pins > 0 {
            return false;
        }
        match &self.content {
            // The registry entry keeps unmapped shared frames for reuse;
            // they can still go.
            Some(FrameContent::Shared { .. }) => true,
            Some(_) => can_swap && self.live_mappings().next().is_some(),
            None => false,
        }
    }

    /// Remove every hardware mapping of `frame`, folding dirty bits into
    /// the sticky flag. Returns the mappings that were attached.
    fn unmap_all(&mut self, frame: &Arc<Frame>) -> Vec<Arc<PageMapping>> {
        let mappings: Vec<_> = self.live_mappings().collect();
        self.mappings.clear();
        for m in &mappings {
            self.dirty |= m.pagedir().is_dirty(m.page());
            m.pagedir().clear(m.page());
            m.forget_frame(frame);
        }
        mappings
    }

    /// Dirty in the sticky flag or in any page table, without clearing.
    fn dirty_now(&self) -> bool {
        self.dirty
            || self
                .live_mappings()
                .any(|m| m.pagedir().is_dirty(m.page()))
    }

    fn is_shared_writable(&self) -> bool {
        matches!(
            self.content,
            Some(FrameContent::Shared { writable: true, .. })
        )
    }
}

/// Running totals reported by [`crate::vm::Vm::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounters {
    pub evictions: u64,
    pub writebacks: u64,
    pub swap_outs: u64,
    pub swap_ins: u64,
}

struct TableInner {
    /// Allocation order.
    frames: Vec<Arc<Frame>>,
    selector: Box<dyn VictimSelector>,
}

/// All frames backing user pages.
pub struct FrameTable {
    phys: PhysMemory,
    limit: Option<usize>,
    swap: Option<Arc<dyn SwapDevice>>,
    table: Mutex<TableInner>,
    evictions: AtomicU64,
    writebacks: AtomicU64,
    swap_outs: AtomicU64,
    swap_ins: AtomicU64,
}

impl FrameTable {
    pub fn new(
        phys: PhysMemory,
        limit: Option<usize>,
        swap: Option<Arc<dyn SwapDevice>>,
        selector: Box<dyn VictimSelector>,
    ) -> Self {
        FrameTable {
            phys,
            limit,
            swap,
            table: Mutex::new(TableInner {
                frames: Vec::new(),
                selector,
            }),
            evictions: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
            swap_outs: AtomicU64::new(0),
            swap_ins: AtomicU64::new(0),
        }
    }

    pub fn phys(&self) -> &PhysMemory {
        &self.phys
    }

    /// Frames currently in the table.
    pub fn len(&self) -> usize {
        self.table.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> FrameCounters {
        FrameCounters {
            evictions: self.evictions.load(Ordering::Relaxed),
            writebacks: self.writebacks.load(Ordering::Relaxed),
            swap_outs: self.swap_outs.load(Ordering::Relaxed),
            swap_ins: self.swap_ins.load(Ordering::Relaxed),
        }
    }

    /// Get a zeroed, pinned frame, evicting one if the pool is exhausted.
    pub fn allocate(&self) -> Result<Arc<Frame>, VmError> {
        {
            let mut table = self.table.lock();
            let under_limit = self.limit.map_or(true, |limit| table.frames.len() < limit);
            if under_limit {
                if let Some(paddr) = self.phys.alloc_zeroed() {
                    let frame = Arc::new(Frame::new(paddr));
                    table.frames.push(frame.clone());
                    return Ok(frame);
                }
            }
        }

        // Frames busy under another CPU's lock are skipped, so a failed
        // sweep is retried before giving up.
        for _ in 0..EVICT_ATTEMPTS {
            if let Some(paddr) = self.evict() {
                let frame = Arc::new(Frame::new(paddr));
                self.table.lock().frames.push(frame.clone());
                return Ok(frame);
            }
            core::hint::spin_loop();
        }
        log::warn!("[FRAME] out of memory: nothing evictable");
        Err(VmError::OutOfMemory)
    }

    /// Pin a live frame for a new mapping. False if it has been retired.
    pub fn pin(&self, frame: &Frame) -> bool {
        let mut inner = frame.inner.lock();
        if inner.retired {
            return false;
        }
        inner.pins += 1;
        true
    }

    /// Drop a pin taken by [`FrameTable::allocate`] or [`FrameTable::pin`]
    /// without attaching a mapping.
    pub fn unpin(&self, frame: &Frame) {
        let mut inner = frame.inner.lock();
        assert!(inner.pins > 0, "unpin of unpinned {:?}", frame);
        inner.pins -= 1;
    }

    /// Tag a freshly loaded frame with the registry content it caches, so
    /// it stays evictable while no mapping uses it.
    pub(crate) fn record_content(&self, frame: &Frame, content: FrameContent) {
        let mut inner = frame.inner.lock();
        assert!(inner.pins > 0, "content recorded on unpinned {:?}", frame);
        assert!(inner.content.is_none(), "{:?} already holds content", frame);
        inner.content = Some(content);
    }

    /// Record that `mapping` now maps `frame`, consuming one pin.
    ///
    /// # Panics
    /// If the frame already holds different content: only identical shared
    /// content may share a frame.
    pub fn attach_mapping(&self, frame: &Frame, mapping: &Arc<PageMapping>) {
        let content = mapping.content().snapshot();
        let mut inner = frame.inner.lock();
        assert!(!inner.retired, "attach to retired {:?}", frame);
        assert!(inner.pins > 0, "attach to unpinned {:?}", frame);

        match &inner.content {
            None => inner.content = Some(content),
            Some(existing) => assert!(
                existing.admits(&content),
                "{:?} holds {} content, cannot attach {}",
                frame,
                existing.name(),
                content.name()
            ),
        }
        inner.mappings.push(Arc::downgrade(mapping));
        inner.pins -= 1;
    }

    /// Unmap `mapping` from `frame`. Returns the mappings left on the frame.
    pub fn detach_mapping(&self, frame: &Frame, mapping: &PageMapping) -> usize {
        let mut inner = frame.inner.lock();
        let target: *const PageMapping = mapping;
        if let Some(pos) = inner.mappings.iter().position(|w| w.as_ptr() == target) {
            inner.dirty |= mapping.pagedir().is_dirty(mapping.page());
            mapping.pagedir().clear(mapping.page());
            inner.mappings.remove(pos);
        }
        inner.mappings.len()
    }

    /// Take `frame` out of the table and return its memory. Shared writable
    /// content is written to `writeback` first if it is dirty. Releasing a
    /// frame that was already evicted does nothing.
    pub fn release(&self, frame: &Arc<Frame>, writeback: Option<&FilePage>) {
        self.remove(frame);

        let mut inner = frame.inner.lock();
        if inner.retired {
            return;
        }
        inner.unmap_all(frame);

        if let Some(file) = writeback {
            if inner.dirty && inner.is_shared_writable() {
                file.writeback(unsafe { self.phys.page_mut(frame.paddr) });
                self.writebacks.fetch_add(1, Ordering::Relaxed);
            }
        }
        inner.retired = true;
        self.phys.free(frame.paddr);
    }

    /// Fill a fresh frame from the swap slot recorded in `state`. The slot
    /// stays reserved until [`FrameTable::finish_swap_in`].
    pub fn swap_in(&self, state: &EvictionState) -> Result<Option<Arc<Frame>>, VmError> {
        let (Some(slot), Some(swap)) = (state.slot(), self.swap.as_ref()) else {
            return Ok(None);
        };
        let frame = self.allocate()?;
        {
            let mut inner = frame.inner.lock();
            swap.read(slot, unsafe { self.phys.page_mut(frame.paddr) });
            // The only copy is now in memory.
            inner.dirty = true;
        }
        self.swap_ins.fetch_add(1, Ordering::Relaxed);
        log::trace!("[FRAME] swapped in slot {} to {:?}", slot.index(), frame);
        Ok(Some(frame))
    }

    /// The swapped-in page is mapped; give its slot back.
    pub fn finish_swap_in(&self, state: &EvictionState) {
        self.discard_swap(state);
    }

    /// Release any swap slot still held for a destroyed page.
    pub fn discard_swap(&self, state: &EvictionState) {
        if let (Some(slot), Some(swap)) = (state.take(), self.swap.as_ref()) {
            swap.release(slot);
        }
    }

    /// Copy of a live frame's bytes.
    pub fn read_frame(&self, frame: &Frame) -> Option<Vec<u8>> {
        let inner = frame.inner.lock();
        if inner.retired {
            return None;
        }
        Some(unsafe { self.phys.page_mut(frame.paddr) }.to_vec())
    }

    /// Overwrite part of a live frame through the kernel mapping.
    pub fn write_frame(&self, frame: &Frame, offset: usize, data: &[u8]) -> bool {
        let inner = frame.inner.lock();
        if inner.retired {
            return false;
        }
        let page = unsafe { self.phys.page_mut(frame.paddr) };
        page[offset..offset + data.len()].copy_from_slice(data);
        true
    }

    /// Byte view of a frame nobody else can reach yet.
    ///
    /// # Safety
    /// `frame` must be pinned and not yet attached or published.
    pub(crate) unsafe fn fresh_page(&self, frame: &Frame) -> &mut [u8] {
        unsafe { self.phys.page_mut(frame.paddr) }
    }

    /// Log every frame.
    pub fn dump(&self) {
        let table = self.table.lock();
        log::info!(
            "[FRAME] Frame table ({} frames, {} policy)",
            table.frames.len(),
            table.selector.name()
        );
        for frame in table.frames.iter() {
            match frame.inner.try_lock() {
                Some(inner) => log::info!(
                    "[FRAME]   (paddr={:#x}, type={}, mappings={}, pins={}, dirty={})",
                    frame.paddr.as_u64(),
                    inner.content.as_ref().map_or("NONE", FrameContent::name),
                    inner.mappings.len(),
                    inner.pins,
                    inner.dirty
                ),
                None => log::info!("[FRAME]   (paddr={:#x}, busy)", frame.paddr.as_u64()),
            }
        }
    }

    fn remove(&self, frame: &Arc<Frame>) {
        let mut table = self.table.lock();
        if let Some(index) = table.frames.iter().position(|f| Arc::ptr_eq(f, frame)) {
            table.frames.remove(index);
            table.selector.removed(index);
        }
    }

    /// Claim a victim and reclaim its physical address.
    fn evict(&self) -> Option<PhysAddr> {
        let can_swap = self.swap.is_some();
        let mut table = self.table.lock();
        let attempts = table.frames.len() + 1;

        for _ in 0..attempts {
            let TableInner { frames, selector } = &mut *table;
            let index = selector.select(frames, can_swap)?;
            let victim = frames[index].clone();

            let Some(mut inner) = victim.inner.try_lock() else {
                continue;
            };
            if !inner.evictable(can_swap) {
                continue;
            }
            // Clean private pages are reproducible and need no slot.
            let private = inner.content.as_ref().map_or(false, FrameContent::is_private);
            let slot = match (private && inner.dirty_now(), self.swap.as_ref()) {
                (true, Some(swap)) => match swap.reserve() {
                    Some(slot) => Some(slot),
                    None => {
                        log::warn!("[FRAME] swap device full");
                        continue;
                    }
                },
                _ => None,
            };

            frames.remove(index);
            selector.removed(index);
            drop(table);

            self.reclaim(&victim, &mut inner, slot);
            return Some(victim.paddr);
        }
        None
    }

    /// Save or discard a claimed victim's content. Runs with the frame lock
    /// held and the table lock dropped.
    fn reclaim(&self, frame: &Arc<Frame>, inner: &mut FrameInner, slot: Option<SwapSlot>) {
        let mappings = inner.unmap_all(frame);
        let bytes = unsafe { self.phys.page_mut(frame.paddr) };

        match inner.content.take() {
            Some(FrameContent::Shared { entry, writable }) => {
                if writable && inner.dirty {
                    match entry.upgrade() {
                        Some(entry) => {
                            entry.file().writeback(bytes);
                            self.writebacks.fetch_add(1, Ordering::Relaxed);
                        }
                        None => log::warn!("[FRAME] {:?} lost its registry entry", frame),
                    }
                }
            }
            Some(_) => {
                let owner = mappings.first().and_then(|m| m.content().eviction());
                match (owner, self.swap.as_ref()) {
                    (Some(state), Some(swap)) if inner.dirty => {
                        // Written between the victim check and the unmap.
                        let Some(slot) = slot.or_else(|| swap.reserve()) else {
                            panic!("{:?} dirtied during eviction with swap full", frame);
                        };
                        swap.write(slot, bytes);
                        state.set(slot);
                        self.swap_outs.fetch_add(1, Ordering::Relaxed);
                    }
                    // Clean: reproducible from the file or as zeros.
                    (_, Some(swap)) => {
                        if let Some(slot) = slot {
                            swap.release(slot);
                        }
                    }
                    (_, None) => {}
                }
            }
            None => {}
        }

        bytes.fill(0);
        inner.retired = true;
        self.evictions.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "[FRAME] evicted {:?} ({} mappings, dirty={})",
            frame,
            mappings.len(),
            inner.dirty
        );
    }
}

//! Demand-paged virtual memory core.
//!
//! Provides:
//! - The [`FrameTable`] of physical frames backing user pages, with eviction
//! - Read-only and writable [`ActiveRegistry`]s deduplicating shared file pages
//! - [`FilePage`]s describing one page of a file
//! - The [`Vm`] context tying them together

pub mod active;
pub mod content;
pub mod evict;
pub mod file_page;
pub mod frame_table;
pub mod strings;

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::config::VmConfig;
use crate::error::VmError;
use crate::fs::FileSystem;
use crate::memory::PhysMemory;

pub use active::{ActiveEntry, ActiveRef, ActiveRegistry, RegistryKind};
pub use content::{EvictionState, PageContent};
pub use evict::{Clock, Fifo, Probe, SwapDevice, SwapSlot, VictimSelector};
pub use file_page::{FileKey, FilePage};
pub use frame_table::{Frame, FrameCounters, FrameTable};
pub use strings::{InternedStr, StringPool};

/// Point-in-time counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    pub frames: usize,
    pub readonly_entries: usize,
    pub writable_entries: usize,
    pub interned_paths: usize,
    pub evictions: u64,
    pub writebacks: u64,
    pub swap_outs: u64,
    pub swap_ins: u64,
}

/// System-wide VM state shared by every address space.
pub struct Vm {
    config: VmConfig,
    filesystem: Arc<dyn FileSystem>,
    paths: StringPool,
    frames: Arc<FrameTable>,
    readonly: ActiveRegistry,
    writable: ActiveRegistry,
}

impl Vm {
    /// VM with the default second-chance replacement policy.
    pub fn new(
        config: VmConfig,
        phys: PhysMemory,
        filesystem: Arc<dyn FileSystem>,
        swap: Option<Arc<dyn SwapDevice>>,
    ) -> Arc<Self> {
        Self::with_policy(config, phys, filesystem, swap, Box::new(Clock::new()))
    }

    pub fn with_policy(
        config: VmConfig,
        phys: PhysMemory,
        filesystem: Arc<dyn FileSystem>,
        swap: Option<Arc<dyn SwapDevice>>,
        selector: Box<dyn VictimSelector>,
    ) -> Arc<Self> {
        log::info!(
            "[VM] Initializing (frame limit {:?}, swap {}, {} policy)",
            config.frame_limit,
            if swap.is_some() { "on" } else { "off" },
            selector.name()
        );
        let frames = Arc::new(FrameTable::new(phys, config.frame_limit, swap, selector));

        Arc::new(Vm {
            config,
            filesystem,
            paths: StringPool::new(),
            readonly: ActiveRegistry::new(RegistryKind::ReadOnly, frames.clone()),
            writable: ActiveRegistry::new(RegistryKind::Writable, frames.clone()),
            frames,
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn filesystem(&self) -> &dyn FileSystem {
        &*self.filesystem
    }

    pub fn paths(&self) -> &StringPool {
        &self.paths
    }

    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    pub fn readonly(&self) -> &ActiveRegistry {
        &self.readonly
    }

    pub fn writable(&self) -> &ActiveRegistry {
        &self.writable
    }

    pub fn registry(&self, kind: RegistryKind) -> &ActiveRegistry {
        match kind {
            RegistryKind::ReadOnly => &self.readonly,
            RegistryKind::Writable => &self.writable,
        }
    }

    /// Open one page of `path`.
    pub fn file_page(&self, path: &str, offset: u64, zero_fill: usize) -> Result<FilePage, VmError> {
        FilePage::create(&*self.filesystem, &self.paths, path, offset, zero_fill)
    }

    pub fn stats(&self) -> VmStats {
        let counters = self.frames.counters();
        VmStats {
            frames: self.frames.len(),
            readonly_entries: self.readonly.len(),
            writable_entries: self.writable.len(),
            interned_paths: self.paths.len(),
            evictions: counters.evictions,
            writebacks: counters.writebacks,
            swap_outs: counters.swap_outs,
            swap_ins: counters.swap_ins,
        }
    }

    /// Log the frame table, both registries and the string pool.
    pub fn dump(&self) {
        self.frames.dump();
        self.readonly.dump();
        self.writable.dump();
        self.paths.dump();
    }

    /// Final report once every process has exited. Anything still live at
    /// this point leaked.
    pub fn shutdown(&self) {
        let stats = self.stats();
        log::info!("[VM] Shutdown: {:?}", stats);
        if stats.frames != 0 || stats.readonly_entries != 0 || stats.writable_entries != 0 {
            log::warn!("[VM] state left behind at shutdown");
            self.dump();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Testbed;

    #[test]
    fn stats_track_registries_and_paths() {
        let bed = Testbed::new(8);
        bed.fs.add("/a", &[1u8; 4096]);
        let vm = &bed.vm;

        let ro = vm.readonly().acquire(vm.file_page("/a", 0, 0).unwrap());
        let rw = vm.writable().acquire(vm.file_page("/a", 0, 0).unwrap());
        let frame = ro.load_page().unwrap();
        vm.frames().unpin(&frame);

        let stats = vm.stats();
        assert_eq!(stats.frames, 1);
        assert_eq!(stats.readonly_entries, 1);
        assert_eq!(stats.writable_entries, 1);
        assert_eq!(stats.interned_paths, 1);

        drop(ro);
        drop(rw);
        assert_eq!(vm.stats(), VmStats::default());
    }

    #[test]
    fn registry_by_kind() {
        let bed = Testbed::new(2);
        assert_eq!(bed.vm.registry(RegistryKind::ReadOnly).kind(), RegistryKind::ReadOnly);
        assert_eq!(bed.vm.registry(RegistryKind::Writable).kind(), RegistryKind::Writable);
    }
}

//! Registries of active shared file content.
//!
//! Every distinct [`FileKey`] with at least one live shared mapping has one
//! [`ActiveEntry`] here, and at most one frame for it exists system-wide.
//! Mappings hold an [`ActiveRef`]; dropping the last one writes the frame
//! back (writable registry only) and forgets the entry.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use super::content::FrameContent;
use super::file_page::{FileKey, FilePage};
use super::frame_table::{Frame, FrameTable};
use crate::error::VmError;

/// Which registry an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    ReadOnly,
    Writable,
}

/// Shared content for one file page.
pub struct ActiveEntry {
    file: FilePage,
    /// Entry lock; held across load and final writeback.
    frame: Mutex<Option<Arc<Frame>>>,
    /// Changed only under the registry lock.
    refs: AtomicUsize,
    /// Releases that took `refs` to zero and have not finished. Changed only
    /// under the registry lock.
    releasing: AtomicUsize,
}

impl ActiveEntry {
    pub fn file(&self) -> &FilePage {
        &self.file
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Attached frame, if loaded and not evicted.
    pub fn frame(&self) -> Option<Arc<Frame>> {
        self.frame.lock().as_ref().filter(|f| f.is_live()).cloned()
    }
}

struct RegistryShared {
    kind: RegistryKind,
    entries: Mutex<BTreeMap<FileKey, Arc<ActiveEntry>>>,
    frames: Arc<FrameTable>,
}

impl RegistryShared {
    fn release(&self, entry: &Arc<ActiveEntry>) {
        let last = {
            let _entries = self.entries.lock();
            let last = entry.refs.fetch_sub(1, Ordering::AcqRel) == 1;
            if last {
                entry.releasing.fetch_add(1, Ordering::AcqRel);
            }
            last
        };
        if !last {
            return;
        }

        // Keep the entry findable until the writeback is done, so a racing
        // acquire revives it and waits on the entry lock instead of reading
        // stale bytes from the file.
        {
            let mut slot = entry.frame.lock();
            if let Some(frame) = slot.take() {
                let writeback = match self.kind {
                    RegistryKind::Writable => Some(&entry.file),
                    RegistryKind::ReadOnly => None,
                };
                self.frames.release(&frame, writeback);
            }
        }

        // Only the last release in flight may forget the entry; an earlier
        // one finishing first must not hide a writeback still under way.
        let mut entries = self.entries.lock();
        let in_flight = entry.releasing.fetch_sub(1, Ordering::AcqRel) - 1;
        if in_flight == 0 && entry.refs.load(Ordering::Acquire) == 0 {
            let key = entry.file.key();
            if entries.get(key).map_or(false, |e| Arc::ptr_eq(e, entry)) {
                entries.remove(key);
                log::trace!("[ACTIVE] dropped {:?}", entry.file);
            }
        }
    }
}

/// A registry of shared file content.
pub struct ActiveRegistry {
    shared: Arc<RegistryShared>,
}

impl ActiveRegistry {
    pub fn new(kind: RegistryKind, frames: Arc<FrameTable>) -> Self {
        ActiveRegistry {
            shared: Arc::new(RegistryShared {
                kind,
                entries: Mutex::new(BTreeMap::new()),
                frames,
            }),
        }
    }

    pub fn kind(&self) -> RegistryKind {
        self.shared.kind
    }

    /// Whether content equal to `file` is active.
    pub fn exists(&self, file: &FilePage) -> bool {
        self.shared.entries.lock().contains_key(file.key())
    }

    /// Count a new reference to `file`'s content, reusing an existing entry
    /// when one matches. A duplicate `file` is closed.
    pub fn acquire(&self, file: FilePage) -> ActiveRef {
        let (entry, duplicate) = {
            let mut entries = self.shared.entries.lock();
            match entries.get(file.key()) {
                Some(entry) => {
                    entry.refs.fetch_add(1, Ordering::AcqRel);
                    (entry.clone(), Some(file))
                }
                None => {
                    let entry = Arc::new(ActiveEntry {
                        file,
                        frame: Mutex::new(None),
                        refs: AtomicUsize::new(1),
                        releasing: AtomicUsize::new(0),
                    });
                    entries.insert(entry.file.key().clone(), entry.clone());
                    (entry, None)
                }
            }
        };
        drop(duplicate);

        ActiveRef {
            registry: self.shared.clone(),
            entry,
        }
    }

    /// References to the entry matching `file`, or 0.
    pub fn ref_count(&self, file: &FilePage) -> usize {
        self.shared
            .entries
            .lock()
            .get(file.key())
            .map_or(0, |e| e.ref_count())
    }

    /// Number of active entries.
    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dump(&self) {
        let entries = self.shared.entries.lock();
        log::info!(
            "[ACTIVE] {:?} registry ({} entries)",
            self.shared.kind,
            entries.len()
        );
        for entry in entries.values() {
            log::info!(
                "[ACTIVE]   (refs={}, loaded={}, body={:?})",
                entry.ref_count(),
                entry.frame().is_some(),
                entry.file
            );
        }
    }
}

/// Counted handle to an [`ActiveEntry`]. Dropping it releases the reference.
pub struct ActiveRef {
    registry: Arc<RegistryShared>,
    entry: Arc<ActiveEntry>,
}

impl ActiveRef {
    pub fn kind(&self) -> RegistryKind {
        self.registry.kind
    }

    pub fn file(&self) -> &FilePage {
        &self.entry.file
    }

    pub(crate) fn entry(&self) -> &Arc<ActiveEntry> {
        &self.entry
    }

    pub fn same_entry(&self, other: &ActiveRef) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }

    /// The entry's frame, loading it on first use or after eviction. The
    /// frame comes back pinned for the caller's mapping.
    pub fn load_page(&self) -> Result<Arc<Frame>, VmError> {
        let frames = &self.registry.frames;
        let mut slot = self.entry.frame.lock();
        if let Some(frame) = slot.as_ref() {
            if frames.pin(frame) {
                return Ok(frame.clone());
            }
        }

        let frame = self.entry.file.load(frames)?;
        frames.record_content(
            &frame,
            FrameContent::Shared {
                entry: Arc::downgrade(&self.entry),
                writable: self.registry.kind == RegistryKind::Writable,
            },
        );
        *slot = Some(frame.clone());
        log::trace!("[ACTIVE] loaded {:?} into {:?}", self.entry.file, frame);
        Ok(frame)
    }
}

impl Drop for ActiveRef {
    fn drop(&mut self) {
        self.registry.release(&self.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Testbed;

    #[test]
    fn equal_pages_share_one_entry() {
        let bed = Testbed::new(8);
        bed.fs.add("/lib", &[3u8; 8192]);
        let vm = &bed.vm;

        let a = vm.readonly().acquire(vm.file_page("/lib", 0, 0).unwrap());
        let b = vm.readonly().acquire(vm.file_page("/lib", 0, 0).unwrap());
        let c = vm.readonly().acquire(vm.file_page("/lib", 4096, 0).unwrap());

        assert!(a.same_entry(&b));
        assert!(!a.same_entry(&c));
        assert_eq!(vm.readonly().len(), 2);
        assert_eq!(a.entry().ref_count(), 2);
        // The duplicate handle was closed.
        assert_eq!(bed.fs.open_handles(), 2);
    }

    #[test]
    fn zero_fill_is_part_of_the_identity() {
        let bed = Testbed::new(8);
        bed.fs.add("/lib", &[3u8; 4096]);
        let vm = &bed.vm;

        let a = vm.readonly().acquire(vm.file_page("/lib", 0, 0).unwrap());
        let b = vm.readonly().acquire(vm.file_page("/lib", 0, 96).unwrap());
        assert!(!a.same_entry(&b));
    }

    #[test]
    fn last_release_removes_entry_and_frame() {
        let bed = Testbed::new(8);
        bed.fs.add("/lib", &[3u8; 4096]);
        let vm = &bed.vm;

        let a = vm.readonly().acquire(vm.file_page("/lib", 0, 0).unwrap());
        let b = vm.readonly().acquire(vm.file_page("/lib", 0, 0).unwrap());
        let frame = a.load_page().unwrap();
        vm.frames().unpin(&frame);

        drop(a);
        assert_eq!(vm.readonly().len(), 1);
        assert!(frame.is_live());

        drop(b);
        assert!(vm.readonly().is_empty());
        assert!(!frame.is_live());
        assert!(vm.frames().is_empty());
        assert_eq!(bed.fs.open_handles(), 0);
        assert!(vm.paths().is_empty());
    }

    #[test]
    fn load_page_reuses_the_attached_frame() {
        let bed = Testbed::new(8);
        bed.fs.add("/lib", &[3u8; 4096]);
        let vm = &bed.vm;

        let a = vm.readonly().acquire(vm.file_page("/lib", 0, 0).unwrap());
        let first = a.load_page().unwrap();
        let second = a.load_page().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.pins(), 2);
        assert_eq!(bed.fs.reads("/lib"), 1);
    }

    #[test]
    fn exists_and_ref_count_follow_the_key() {
        let bed = Testbed::new(8);
        bed.fs.add("/lib", &[3u8; 4096]);
        let vm = &bed.vm;
        let probe = vm.file_page("/lib", 0, 0).unwrap();

        assert!(!vm.writable().exists(&probe));
        let a = vm.writable().acquire(vm.file_page("/lib", 0, 0).unwrap());
        assert!(vm.writable().exists(&probe));
        assert!(!vm.readonly().exists(&probe));
        assert_eq!(vm.writable().ref_count(&probe), 1);
        drop(a);
        assert_eq!(vm.writable().ref_count(&probe), 0);
    }

    #[test]
    fn revived_entry_is_dropped_by_the_last_release() {
        let bed = Testbed::new(8);
        bed.fs.add("/lib", &[3u8; 4096]);
        let vm = &bed.vm;
        let a = vm.writable().acquire(vm.file_page("/lib", 0, 0).unwrap());
        let entry = a.entry().clone();

        std::thread::scope(|s| {
            // Park both final releases behind the entry lock.
            let held = entry.frame.lock();
            s.spawn(move || drop(a));
            while entry.releasing.load(Ordering::Acquire) < 1 {
                core::hint::spin_loop();
            }

            let b = vm.writable().acquire(vm.file_page("/lib", 0, 0).unwrap());
            assert!(Arc::ptr_eq(b.entry(), &entry));
            s.spawn(move || drop(b));
            while entry.releasing.load(Ordering::Acquire) < 2 {
                core::hint::spin_loop();
            }
            assert_eq!(vm.writable().len(), 1);
            drop(held);
        });

        assert_eq!(entry.ref_count(), 0);
        assert_eq!(entry.releasing.load(Ordering::Acquire), 0);
        assert!(vm.writable().is_empty());
    }

    #[test]
    fn concurrent_acquires_deduplicate() {
        let bed = Testbed::new(8);
        bed.fs.add("/lib", &[3u8; 4096]);
        let vm = bed.vm.clone();

        let handles: alloc::vec::Vec<_> = (0..8)
            .map(|_| {
                let vm = vm.clone();
                std::thread::spawn(move || {
                    let active = vm.readonly().acquire(vm.file_page("/lib", 0, 0).unwrap());
                    let frame = active.load_page().unwrap();
                    let paddr = frame.paddr();
                    vm.frames().unpin(&frame);
                    (active, paddr)
                })
            })
            .collect();
        let results: alloc::vec::Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(vm.readonly().len(), 1);
        assert!(results.iter().all(|(_, p)| *p == results[0].1));
        assert_eq!(results[0].0.entry().ref_count(), 8);
        assert_eq!(bed.fs.reads("/lib"), 1);
    }
}

//! What backs a virtual page.

use alloc::sync::{Arc, Weak};
use spin::Mutex;

use super::active::{ActiveEntry, ActiveRef, RegistryKind};
use super::evict::SwapSlot;
use super::file_page::FilePage;

/// Swap placeholder for pages that have no shared backing.
///
/// `slot` is `Some` exactly while the page content lives in swap. Leaf lock.
pub struct EvictionState {
    slot: Mutex<Option<SwapSlot>>,
}

impl EvictionState {
    /// Not swapped.
    pub fn new() -> Self {
        EvictionState {
            slot: Mutex::new(None),
        }
    }

    pub fn is_swapped(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn slot(&self) -> Option<SwapSlot> {
        *self.slot.lock()
    }

    pub(crate) fn set(&self, slot: SwapSlot) {
        let previous = self.slot.lock().replace(slot);
        assert!(previous.is_none(), "page swapped out twice ({:?})", previous);
    }

    pub(crate) fn take(&self) -> Option<SwapSlot> {
        self.slot.lock().take()
    }
}

impl Default for EvictionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-mapping description of the page's content.
pub enum PageContent {
    /// Code, rodata or a read-only mmap; frame shared and never dirtied.
    SharedReadOnlyFile(ActiveRef),
    /// Writable shared mmap; written back when the last mapping goes away.
    SharedWritableFile(ActiveRef),
    /// Private copy of file content, e.g. an executable's data segment.
    PrivateFileBacked(FilePage, EvictionState),
    /// Zero-filled page with no file behind it (stack).
    Anonymous(EvictionState),
}

impl PageContent {
    /// Wrap a registry handle in the variant matching its registry.
    pub fn shared(active: ActiveRef) -> Self {
        match active.kind() {
            RegistryKind::ReadOnly => PageContent::SharedReadOnlyFile(active),
            RegistryKind::Writable => PageContent::SharedWritableFile(active),
        }
    }

    pub fn private_file(file: FilePage) -> Self {
        PageContent::PrivateFileBacked(file, EvictionState::new())
    }

    pub fn anonymous() -> Self {
        PageContent::Anonymous(EvictionState::new())
    }

    pub fn is_shared(&self) -> bool {
        matches!(
            self,
            PageContent::SharedReadOnlyFile(_) | PageContent::SharedWritableFile(_)
        )
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, PageContent::SharedReadOnlyFile(_))
    }

    /// Registry handle for shared content.
    pub fn active(&self) -> Option<&ActiveRef> {
        match self {
            PageContent::SharedReadOnlyFile(active) | PageContent::SharedWritableFile(active) => {
                Some(active)
            }
            _ => None,
        }
    }

    /// Swap placeholder for private content.
    pub fn eviction(&self) -> Option<&EvictionState> {
        match self {
            PageContent::PrivateFileBacked(_, state) | PageContent::Anonymous(state) => Some(state),
            _ => None,
        }
    }

    /// Same shared content (same registry entry).
    ///
    /// Private and anonymous content is never deduplicated, so comparing it
    /// is a bug in the caller.
    pub fn equal(&self, other: &PageContent) -> bool {
        match (self, other) {
            (PageContent::SharedReadOnlyFile(a), PageContent::SharedReadOnlyFile(b))
            | (PageContent::SharedWritableFile(a), PageContent::SharedWritableFile(b)) => {
                a.same_entry(b)
            }
            (PageContent::SharedReadOnlyFile(_), PageContent::SharedWritableFile(_))
            | (PageContent::SharedWritableFile(_), PageContent::SharedReadOnlyFile(_)) => false,
            _ => panic!("private page content is never compared"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PageContent::SharedReadOnlyFile(_) => "SHARED_READ_ONLY",
            PageContent::SharedWritableFile(_) => "SHARED_WRITABLE",
            PageContent::PrivateFileBacked(..) => "PRIVATE_FILE",
            PageContent::Anonymous(_) => "ANONYMOUS",
        }
    }

    pub(crate) fn snapshot(&self) -> FrameContent {
        match self {
            PageContent::SharedReadOnlyFile(active) => FrameContent::Shared {
                entry: Arc::downgrade(active.entry()),
                writable: false,
            },
            PageContent::SharedWritableFile(active) => FrameContent::Shared {
                entry: Arc::downgrade(active.entry()),
                writable: true,
            },
            PageContent::PrivateFileBacked(..) => FrameContent::PrivateFile,
            PageContent::Anonymous(_) => FrameContent::Anonymous,
        }
    }
}

impl core::fmt::Debug for PageContent {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            PageContent::SharedReadOnlyFile(active) | PageContent::SharedWritableFile(active) => {
                write!(f, "(type={}, body={:?})", self.name(), active.file())
            }
            PageContent::PrivateFileBacked(file, state) => {
                write!(f, "(type={}, swap={:?}, file={:?})", self.name(), state.slot(), file)
            }
            PageContent::Anonymous(state) => {
                write!(f, "(type={}, swap={:?})", self.name(), state.slot())
            }
        }
    }
}

/// Content recorded on a frame when its first mapping attaches.
#[derive(Clone)]
pub(crate) enum FrameContent {
    Shared {
        entry: Weak<ActiveEntry>,
        writable: bool,
    },
    PrivateFile,
    Anonymous,
}

impl FrameContent {
    /// Whether a second mapping with content `other` may share this frame.
    pub(crate) fn admits(&self, other: &FrameContent) -> bool {
        match (self, other) {
            (
                FrameContent::Shared { entry: a, writable: wa },
                FrameContent::Shared { entry: b, writable: wb },
            ) => wa == wb && Weak::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn is_private(&self) -> bool {
        !matches!(self, FrameContent::Shared { .. })
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            FrameContent::Shared { writable: false, .. } => "SHARED_READ_ONLY",
            FrameContent::Shared { writable: true, .. } => "SHARED_WRITABLE",
            FrameContent::PrivateFile => "PRIVATE_FILE",
            FrameContent::Anonymous => "ANONYMOUS",
        }
    }
}

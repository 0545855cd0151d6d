//! One page worth of a file.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::mem::ManuallyDrop;
use spin::Mutex;

use super::frame_table::{Frame, FrameTable};
use super::strings::{InternedStr, StringPool};
use crate::config::PAGE_SIZE;
use crate::error::VmError;
use crate::fs::{self, File, FileSystem};

/// Identity of a file page: two pages with equal keys hold the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileKey {
    pub path: InternedStr,
    pub offset: u64,
    pub zero_fill: usize,
}

/// The bytes `[offset, offset + PAGE_SIZE - zero_fill)` of a file, followed
/// by `zero_fill` zero bytes. Owns an open handle for the page's lifetime.
pub struct FilePage {
    key: FileKey,
    file: ManuallyDrop<Mutex<Box<dyn File>>>,
}

impl FilePage {
    /// Open `path` for one page.
    ///
    /// # Panics
    /// If `zero_fill` exceeds a page.
    pub fn create(
        filesystem: &dyn FileSystem,
        paths: &StringPool,
        path: &str,
        offset: u64,
        zero_fill: usize,
    ) -> Result<FilePage, VmError> {
        assert!(
            zero_fill <= PAGE_SIZE,
            "zero fill {} exceeds a page",
            zero_fill
        );
        let path = paths.intern(path)?;
        let file = {
            let _fs = fs::lock();
            filesystem.open(&path)
        }
        .ok_or(VmError::FileNotFound)?;

        Ok(Self::with_handle(path, offset, zero_fill, file))
    }

    /// One page of a file that is already open as `file`.
    ///
    /// # Panics
    /// If `zero_fill` exceeds a page.
    pub fn with_handle(
        path: InternedStr,
        offset: u64,
        zero_fill: usize,
        file: Box<dyn File>,
    ) -> FilePage {
        // Owned before the check, so a failed check still closes the handle.
        let page = FilePage {
            key: FileKey {
                path,
                offset,
                zero_fill,
            },
            file: ManuallyDrop::new(Mutex::new(file)),
        };
        assert!(
            zero_fill <= PAGE_SIZE,
            "zero fill {} exceeds a page",
            zero_fill
        );
        page
    }

    pub fn key(&self) -> &FileKey {
        &self.key
    }

    pub fn path(&self) -> &str {
        &self.key.path
    }

    pub fn offset(&self) -> u64 {
        self.key.offset
    }

    pub fn zero_fill(&self) -> usize {
        self.key.zero_fill
    }

    /// Bytes that come from the file.
    pub fn read_len(&self) -> usize {
        PAGE_SIZE - self.key.zero_fill
    }

    /// Allocate a frame and fill it with this page. The frame comes back
    /// pinned.
    pub fn load(&self, frames: &FrameTable) -> Result<Arc<Frame>, VmError> {
        let frame = frames.allocate()?;
        let len = self.read_len();

        let read = {
            let page = unsafe { frames.fresh_page(&frame) };
            let read = {
                let _fs = fs::lock();
                let mut file = self.file.lock();
                file.seek(self.key.offset);
                file.read(&mut page[..len])
            };
            page[len..].fill(0);
            read
        };

        if read != len {
            log::warn!(
                "[VM] short read of {} at {:#x}: {} of {} bytes",
                self.key.path,
                self.key.offset,
                read,
                len
            );
            frames.unpin(&frame);
            frames.release(&frame, None);
            return Err(VmError::ShortRead);
        }
        Ok(frame)
    }

    /// Write the file part of `page` back at this page's offset.
    ///
    /// # Panics
    /// On a short write; the file can no longer be trusted.
    pub fn writeback(&self, page: &[u8]) {
        let len = self.read_len();
        let written = {
            let _fs = fs::lock();
            let mut file = self.file.lock();
            file.seek(self.key.offset);
            file.write(&page[..len])
        };
        assert_eq!(
            written, len,
            "short writeback of {} at {:#x}",
            self.key.path, self.key.offset
        );
    }
}

impl Drop for FilePage {
    fn drop(&mut self) {
        let _fs = fs::lock();
        // Closing is a file-system call.
        unsafe { ManuallyDrop::drop(&mut self.file) };
    }
}

impl core::fmt::Debug for FilePage {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "(path={}, offset={:#x}, zero_fill={})",
            self.key.path, self.key.offset, self.key.zero_fill
        )
    }
}

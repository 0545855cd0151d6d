//! File-system contract used for page I/O.
//!
//! The raw file system is not thread-safe; every call into it is made with
//! [`FILESYS_LOCK`] held. The rest of the kernel takes the same lock.

use alloc::boxed::Box;
use spin::{Mutex, MutexGuard};

/// Global file-system lock. Last in the VM lock order.
pub static FILESYS_LOCK: Mutex<()> = Mutex::new(());

/// Acquire the global file-system lock.
pub fn lock() -> MutexGuard<'static, ()> {
    FILESYS_LOCK.lock()
}

/// An open file. Closing happens on drop.
pub trait File: Send {
    /// File length in bytes.
    fn length(&self) -> u64;
    /// Move the file position.
    fn seek(&mut self, pos: u64);
    /// Read at the file position; returns bytes read.
    fn read(&mut self, buf: &mut [u8]) -> usize;
    /// Write at the file position; returns bytes written.
    fn write(&mut self, buf: &[u8]) -> usize;
    /// Another handle on the same file, with its own position.
    fn reopen(&self) -> Box<dyn File>;
}

/// The mounted file system.
pub trait FileSystem: Send + Sync {
    /// Open `path`, or `None` if it does not exist.
    fn open(&self, path: &str) -> Option<Box<dyn File>>;
}

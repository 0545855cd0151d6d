//! Tunables for the VM core.

use log::LevelFilter;
use x86_64::VirtAddr;

/// Size of a user page and of a physical frame.
pub const PAGE_SIZE: usize = 4096;

/// First address above user space: the last canonical lower-half page is
/// left unmapped, so the stack top is itself a valid address.
pub const DEFAULT_USER_TOP: u64 = 0x0000_7fff_ffff_f000;

/// Longest path the string pool accepts (including the terminator a C
/// file system would need).
pub const MAX_PATH_LEN: usize = PAGE_SIZE - 1;

/// Runtime configuration, fixed at [`crate::init`].
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// First address above user space. Mappings must end at or below it.
    pub user_top: VirtAddr,
    /// Top of the initial user stack; the first stack page sits just below.
    pub stack_top: VirtAddr,
    /// Upper bound on frames backing user pages. `None` means "whatever the
    /// physical allocator can hand out".
    pub frame_limit: Option<usize>,
    /// Maximum log level forwarded to the serial console.
    pub log_level: LevelFilter,
}

impl VmConfig {
    /// Builder: set the user-space ceiling.
    pub fn with_user_top(mut self, top: u64) -> Self {
        self.user_top = VirtAddr::new(top);
        self
    }

    /// Builder: set the initial stack top.
    pub fn with_stack_top(mut self, top: u64) -> Self {
        self.stack_top = VirtAddr::new(top);
        self
    }

    /// Builder: cap the number of user frames (forces eviction earlier).
    pub fn with_frame_limit(mut self, frames: usize) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Builder: set the log level.
    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            user_top: VirtAddr::new(DEFAULT_USER_TOP),
            stack_top: VirtAddr::new(DEFAULT_USER_TOP),
            frame_limit: None,
            log_level: LevelFilter::Info,
        }
    }
}

//! Recoverable VM errors.
//!
//! Invariant violations (double activation, mismatched shared attach,
//! short writeback, tearing down an exited process twice) are not listed
//! here: they panic, and the kernel panic handler halts.

/// Errors surfaced to VM callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No free frame and nothing evictable.
    OutOfMemory,
    /// The backing file could not be opened.
    FileNotFound,
    /// Backing file returned fewer bytes than the page needs.
    ShortRead,
    /// The hardware page table refused the mapping.
    InstallFailed,
    /// A mapping already exists at this virtual page.
    AlreadyMapped,
    /// No mapping covers the address.
    NotMapped,
    /// Fault on a page that is already present (protection fault).
    AccessViolation,
    /// Address is not page-aligned.
    Misaligned,
    /// Address is null.
    NullAddress,
    /// Range leaves user space.
    NotUserAddress,
    /// Cannot map a zero-length file.
    EmptyFile,
    /// Requested range overlaps an existing mapping.
    Overlap,
    /// Descriptor does not name an open file.
    BadDescriptor,
    /// Path does not fit in the string pool.
    PathTooLong,
    /// The process has already torn down its address space.
    ProcessExited,
}

impl VmError {
    /// Rejections that leave no side effects and go straight back to the
    /// calling program.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            VmError::AlreadyMapped
                | VmError::Misaligned
                | VmError::NullAddress
                | VmError::NotUserAddress
                | VmError::EmptyFile
                | VmError::Overlap
                | VmError::BadDescriptor
                | VmError::PathTooLong
                | VmError::ProcessExited
        )
    }
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::FileNotFound => write!(f, "file not found"),
            VmError::ShortRead => write!(f, "short read"),
            VmError::InstallFailed => write!(f, "page table install failed"),
            VmError::AlreadyMapped => write!(f, "already mapped"),
            VmError::NotMapped => write!(f, "not mapped"),
            VmError::AccessViolation => write!(f, "access violation"),
            VmError::Misaligned => write!(f, "misaligned address"),
            VmError::NullAddress => write!(f, "null address"),
            VmError::NotUserAddress => write!(f, "not a user address"),
            VmError::EmptyFile => write!(f, "empty file"),
            VmError::Overlap => write!(f, "overlapping mapping"),
            VmError::BadDescriptor => write!(f, "bad descriptor"),
            VmError::PathTooLong => write!(f, "path too long"),
            VmError::ProcessExited => write!(f, "process exited"),
        }
    }
}

//! The kernel's fallible-boundary error type.
//!
//! Per spec.md §7: invariant violations and resource exhaustion stay
//! `panic!`s (the teacher panics throughout `bio.rs`/`fs/inode.rs` on
//! exactly these conditions); this enum only covers the "user-side error"
//! and "killed-wait" rows of that table, i.e. conditions a syscall or a
//! blocking wait can legitimately report back to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Pathname component not found.
    NoSuchFile,
    /// Expected a directory inode, found something else.
    NotADirectory,
    /// Expected a non-directory inode, found a directory.
    IsADirectory,
    /// A directory already has an entry with that name.
    AlreadyExists,
    /// A path component exceeded `FILE_NAME_MAX_LENGTH`.
    NameTooLong,
    /// A file descriptor index was out of range or unused.
    BadFd,
    /// A process id did not name a live process.
    NoSuchProcess,
    /// `wait` was called with no live or exited children.
    NoChildren,
    /// An argument failed a caller-visible precondition (e.g. a write
    /// past `INODE_MAX_BYTES`, or a fault address with no section).
    InvalidArgument,
    /// An alertable wait returned early because the caller was killed.
    Killed,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl KernelError {
    /// Syscalls report failures as a negative errno-shaped integer;
    /// this is the canonical mapping used by `syscall`.
    pub fn to_errno(self) -> i32 {
        match self {
            KernelError::NoSuchFile => -1,
            KernelError::NotADirectory => -2,
            KernelError::IsADirectory => -3,
            KernelError::AlreadyExists => -4,
            KernelError::NameTooLong => -5,
            KernelError::BadFd => -6,
            KernelError::NoSuchProcess => -7,
            KernelError::NoChildren => -8,
            KernelError::InvalidArgument => -9,
            KernelError::Killed => -10,
        }
    }
}

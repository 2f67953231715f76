//! Kernel-internal error kinds.
//!
//! Drivers and subsystems pass these around as tagged variants; the
//! syscall dispatcher is the only place that flattens them into negative
//! POSIX errno values for userland. Panics are reserved for invariant
//! violations and never used for recoverable failures.

/// One error kind per failure class the core can produce.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KernelError {
    /// Operation not permitted.
    NotPermitted,
    /// No such file or directory.
    NotFound,
    /// Bad file descriptor.
    BadFd,
    /// Out of kernel memory.
    OutOfMemory,
    /// Permission denied.
    PermissionDenied,
    /// User pointer outside the process's mapped regions.
    BadAddress,
    /// Path already exists.
    AlreadyExists,
    /// Path component is not a directory.
    NotADirectory,
    /// Directory where a file was expected.
    IsADirectory,
    /// Invalid argument.
    InvalidArgument,
    /// Per-process file table is full.
    TooManyFiles,
    /// No space left on the filesystem.
    NoSpace,
    /// Unimplemented syscall or operation.
    NotSupported,
    /// Path or component over the limit.
    NameTooLong,
    /// Directory not empty.
    NotEmpty,
    /// Device or filesystem I/O failure.
    Io,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl KernelError {
    /// The POSIX errno this kind maps to at the syscall boundary.
    pub const fn errno(self) -> i32 {
        match self {
            KernelError::NotPermitted => 1,     // EPERM
            KernelError::NotFound => 2,         // ENOENT
            KernelError::Io => 5,               // EIO
            KernelError::BadFd => 9,            // EBADF
            KernelError::OutOfMemory => 12,     // ENOMEM
            KernelError::PermissionDenied => 13, // EACCES
            KernelError::BadAddress => 14,      // EFAULT
            KernelError::AlreadyExists => 17,   // EEXIST
            KernelError::NotADirectory => 20,   // ENOTDIR
            KernelError::IsADirectory => 21,    // EISDIR
            KernelError::InvalidArgument => 22, // EINVAL
            KernelError::TooManyFiles => 24,    // EMFILE
            KernelError::NoSpace => 28,         // ENOSPC
            KernelError::NameTooLong => 36,     // ENAMETOOLONG
            KernelError::NotEmpty => 39,        // ENOTEMPTY
            KernelError::NotSupported => 38,    // ENOSYS
        }
    }

    /// Syscall return value encoding: negative errno in a machine word.
    pub const fn to_ret(self) -> isize {
        -(self.errno() as isize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_the_standard_table() {
        assert_eq!(KernelError::NotFound.errno(), 2);
        assert_eq!(KernelError::BadFd.errno(), 9);
        assert_eq!(KernelError::BadAddress.errno(), 14);
        assert_eq!(KernelError::NotSupported.errno(), 38);
        assert_eq!(KernelError::NotEmpty.errno(), 39);
        assert_eq!(KernelError::NotFound.to_ret(), -2);
    }
}

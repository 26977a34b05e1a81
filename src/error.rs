use core::fmt;

/// Generic result type for traversal operations
pub type Result<T> = core::result::Result<T, TraversalError>;

/**
 The error type surfaced by the walk entry point.

 Per-entry failures (`EACCES` on a subdirectory, a racing unlink, a symlink
 loop) are not represented here: those travel through the visit callback so
 recovery mode can act on them. `TraversalError` only covers faults that end
 the traversal itself, and it always preserves the first responsible errno
 where one exists.
*/
#[derive(Debug)]
#[allow(clippy::exhaustive_enums)]
pub enum TraversalError {
    /// A syscall failed fatally; `errno` is the first observed error code and
    /// `path` the entry being processed at the time (empty when unknown).
    Io { errno: i32, path: Box<[u8]> },
    /// The caller supplied no root paths.
    EmptyRoots,
    /// `max_open_fd` below the minimum of 2.
    DescriptorBudget(usize),
    /// An internal allocation failed and the traversal aborted after
    /// best-effort cleanup of the still-queued nodes.
    AllocationFailure,
}

impl TraversalError {
    /// Builds an [`Io`](Self::Io) error from the calling thread's errno.
    #[must_use]
    #[inline]
    pub fn last_os_error(path: &[u8]) -> Self {
        Self::Io {
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO),
            path: path.into(),
        }
    }

    /// Builds an [`Io`](Self::Io) error from a known errno.
    #[must_use]
    #[inline]
    pub fn from_errno(errno: i32, path: &[u8]) -> Self {
        Self::Io {
            errno,
            path: path.into(),
        }
    }

    /// The raw OS error code this failure maps to.
    ///
    /// Non-syscall failures report the closest POSIX equivalent (`EINVAL`
    /// for bad configuration, `ENOMEM` for allocation failure) so callers
    /// can always hand one errno back to their own caller.
    #[must_use]
    #[inline]
    pub const fn errno(&self) -> i32 {
        match *self {
            Self::Io { errno, .. } => errno,
            Self::EmptyRoots | Self::DescriptorBudget(_) => libc::EINVAL,
            Self::AllocationFailure => libc::ENOMEM,
        }
    }
}

impl fmt::Display for TraversalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Io { errno, ref path } => {
                let err = std::io::Error::from_raw_os_error(errno);
                if path.is_empty() {
                    write!(f, "traversal failed: {err}")
                } else {
                    write!(f, "traversal failed at {:?}: {err}", String::from_utf8_lossy(path))
                }
            }
            Self::EmptyRoots => write!(f, "no root paths supplied"),
            Self::DescriptorBudget(n) => {
                write!(f, "max_open_fd must be at least 2, got {n}")
            }
            Self::AllocationFailure => write!(f, "out of memory while queueing directories"),
        }
    }
}

impl core::error::Error for TraversalError {}

impl From<std::io::Error> for TraversalError {
    #[inline]
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            errno: err.raw_os_error().unwrap_or(libc::EIO),
            path: Box::default(),
        }
    }
}

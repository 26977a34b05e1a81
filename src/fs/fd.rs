use crate::fs::Errno;
use core::ffi::c_char;

/// Flags for every directory descriptor this crate opens.
///
/// `O_DIRECTORY` rejects non-directories at the syscall boundary, `O_CLOEXEC`
/// keeps descriptors out of spawned children, `O_NONBLOCK` stops a FIFO-like
/// mount from wedging the walk on open.
pub(crate) const OPEN_DIR_FLAGS: i32 =
    libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NONBLOCK;

/**
 An owned file descriptor for internal IO.

 Unlike the standard library's `OwnedFd` this is freely constructible from
 the raw descriptors that come back from `openat`/`dup` syscalls, and its
 close is deliberately fire-and-forget: descriptor exhaustion is handled at
 open time (see the cache's `EMFILE` shrink), not at close time.
*/
#[derive(Debug)]
#[repr(transparent)]
pub struct FileDes(pub(crate) i32);

impl FileDes {
    /// Opens the directory at `path` (NUL terminated) relative to `base_fd`,
    /// which may be `libc::AT_FDCWD`.
    #[inline]
    pub fn open_dir_at(base_fd: i32, path: *const c_char) -> Result<Self, Errno> {
        // SAFETY: the path is NUL terminated by contract and base_fd is either
        // a live descriptor or AT_FDCWD
        let fd = unsafe { libc::openat(base_fd, path, OPEN_DIR_FLAGS) };
        if fd < 0 {
            Err(last_errno())
        } else {
            Ok(Self(fd))
        }
    }

    /// Duplicates the descriptor with close-on-exec set.
    ///
    /// The duplicate shares the file offset with the original, which is what
    /// lets a reader stream entries through the dup while the original stays
    /// cached as an `openat` base.
    #[inline]
    pub fn dup_cloexec(&self) -> Result<Self, Errno> {
        // SAFETY: self.0 is a live descriptor while self is alive
        let fd = unsafe { libc::fcntl(self.0, libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            Err(last_errno())
        } else {
            Ok(Self(fd))
        }
    }

    /// Returns the raw descriptor without giving up ownership.
    #[must_use]
    #[inline]
    pub const fn as_raw(&self) -> i32 {
        self.0
    }

    /// Consumes the wrapper, returning the raw descriptor. The caller takes
    /// over the close obligation.
    #[must_use]
    #[inline]
    pub fn into_raw(self) -> i32 {
        let fd = self.0;
        core::mem::forget(self);
        fd
    }

    /// Wraps a descriptor the caller already owns.
    #[must_use]
    #[inline]
    pub const fn from_raw(fd: i32) -> Self {
        Self(fd)
    }

    /// Checks if the file descriptor is currently open.
    #[must_use]
    #[inline]
    pub fn is_open(&self) -> bool {
        // Use fcntl with F_GETFD to check if the file descriptor is valid
        // If it returns -1 with errno EBADF, the fd is closed
        // SAFETY: always safe, fcntl tolerates dead descriptors
        unsafe { libc::fcntl(self.0, libc::F_GETFD) != -1 }
    }
}

impl Drop for FileDes {
    #[inline]
    fn drop(&mut self) {
        // Negative descriptors are the "already taken" placeholder state.
        if self.0 >= 0 {
            // SAFETY: we own the descriptor and it is closed exactly here
            unsafe { libc::close(self.0) };
        }
    }
}

/// Reads the calling thread's errno.
#[must_use]
#[inline]
pub(crate) fn last_errno() -> Errno {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/**
 A reusable NUL-terminated path buffer for syscalls.

 Composed relative paths can exceed `PATH_MAX` (that is the `ENAMETOOLONG`
 case the cache recovers from), so this grows rather than capping at a fixed
 size. One instance is reused per traversal; `set` truncates and rewrites.
*/
#[derive(Debug, Default)]
pub struct CPathBuf {
    bytes: Vec<u8>,
}

impl CPathBuf {
    #[must_use]
    #[inline]
    pub const fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Replaces the contents with `path` plus a terminating NUL.
    #[inline]
    pub fn set(&mut self, path: &[u8]) -> &mut Self {
        self.bytes.clear();
        self.bytes.reserve(path.len() + 1);
        self.bytes.extend_from_slice(path);
        self.bytes.push(0);
        self
    }

    /// Appends `segment` before the terminating NUL. The buffer must have
    /// been `set` first.
    #[inline]
    pub fn push_segment(&mut self, segment: &[u8]) -> &mut Self {
        debug_assert!(
            self.bytes.last() == Some(&0),
            "push_segment on an unterminated buffer"
        );
        self.bytes.pop();
        self.bytes.extend_from_slice(segment);
        self.bytes.push(0);
        self
    }

    /// Pointer suitable for handing straight to `openat`/`fstatat`.
    #[must_use]
    #[inline]
    pub fn as_ptr(&self) -> *const c_char {
        debug_assert!(!self.bytes.is_empty(), "CPathBuf used before set()");
        self.bytes.as_ptr().cast()
    }

    /// The path bytes without the terminating NUL.
    #[must_use]
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.split_last().map_or(&[], |(_, rest)| rest)
    }
}

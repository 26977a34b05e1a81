use crate::fs::{AlignedBuffer, Errno, FileDes, fd::last_errno};
use core::ffi::CStr;
use core::ptr::NonNull;
use libc::dirent64;

#[cfg(not(debug_assertions))]
pub(crate) const DIRENT_BUFFER_SIZE: usize = 8 * 4096;

// Smaller batches under test builds so many concurrent fixtures don't balloon
#[cfg(debug_assertions)]
pub(crate) const DIRENT_BUFFER_SIZE: usize = 4096;

const_assert!(DIRENT_BUFFER_SIZE >= 4096, "Buffer size too small!");

/// Kernel batch buffer for `getdents64` reads.
pub(crate) type SyscallBuffer = AlignedBuffer<DIRENT_BUFFER_SIZE>;

// Access the last field and then round up to find the minimum struct size
const MINIMUM_DIRENT_SIZE: usize = core::mem::offset_of!(dirent64, d_name).next_multiple_of(8);

const_assert!(
    MINIMUM_DIRENT_SIZE == 24,
    "minimum dirent size isnt 24 on this system, please report the error"
);

// The largest name any supported filesystem can produce is ZFS's 1023 bytes;
// everything else caps at 255 (510 for UTF-16 backed filesystems like CIFS).
// reiserfs's 4032-byte names are not supported.
const MAX_SIZED_DIRENT: usize = 1023 + 1 + MINIMUM_DIRENT_SIZE;

/**
 A streaming directory reader over a raw file descriptor.

 Batches entries through the `getdents64` system call rather than libc's
 `readdir`, which keeps the reader independent of `DIR*` ownership semantics:
 the descriptor it reads through is a dup, and the original stays available
 as an `openat` base for children while streaming is in progress.

 Unlike `readdir`-based iteration this never implicitly stats entries; type
 information comes from `d_type` and anything further is the caller's call.

 Errors from the underlying syscall are returned once and latch
 [`end_of_stream`]: a directory that faults mid-stream yields its error and
 then behaves as exhausted.

 [`end_of_stream`]: DirStream::fill_buffer
*/
pub struct DirStream {
    /// The dup'd descriptor owned by this stream, closed on drop
    fd: FileDes,
    /// Kernel buffer for batch reading directory entries
    buffer: Box<SyscallBuffer>,
    /// Current read position within the entry buffer
    offset: usize,
    /// Bytes of valid entry data in the buffer
    remaining_bytes: usize,
    /// Marker for when the descriptor can give no more entries
    end_of_stream: bool,
}

impl DirStream {
    /// Takes ownership of `fd` and prepares to stream its entries.
    #[must_use]
    #[inline]
    pub fn new(fd: FileDes) -> Self {
        debug_assert!(fd.is_open(), "We expect it to always be open");
        Self {
            fd,
            buffer: Box::new(SyscallBuffer::new()),
            offset: 0,
            remaining_bytes: 0,
            end_of_stream: false,
        }
    }

    /// The descriptor this stream reads through.
    #[must_use]
    #[inline]
    pub const fn dirfd(&self) -> &FileDes {
        &self.fd
    }

    #[inline]
    #[allow(clippy::cast_sign_loss)]
    fn fill_buffer(&mut self) -> Result<bool, Errno> {
        if self.end_of_stream {
            return Ok(false);
        }

        // SAFETY: the buffer is valid for writes of its full capacity and the
        // descriptor is open while self is alive
        let ret = unsafe {
            libc::syscall(
                libc::SYS_getdents64,
                self.fd.as_raw(),
                self.buffer.as_mut_ptr(),
                DIRENT_BUFFER_SIZE,
            )
        };

        if ret < 0 {
            self.end_of_stream = true;
            return Err(last_errno());
        }

        self.remaining_bytes = ret as usize;
        self.offset = 0;

        /*
         End-of-stream detection without the final zero-byte syscall: a full
         batch returns close to the buffer capacity, so when the kernel hands
         back fewer than (capacity - largest possible record) bytes there is
         no record it could have held back, and the next call would return 0.
         Small directories complete in exactly one getdents64 this way.
        */
        self.end_of_stream = ret == 0
            || self.buffer.max_capacity() - MAX_SIZED_DIRENT >= self.remaining_bytes;

        Ok(ret > 0)
    }

    /**
     Advances to the next raw entry, including `.` and `..`.

     Returns `Ok(None)` at end of directory. An I/O fault from the kernel is
     reported once as `Err`; subsequent calls return `Ok(None)`.
    */
    #[inline]
    #[allow(clippy::cast_ptr_alignment)]
    pub fn next_entry(&mut self) -> Result<Option<RawEntry<'_>>, Errno> {
        loop {
            if self.offset < self.remaining_bytes {
                // SAFETY: offset points at a record the kernel wrote; records
                // are 8-aligned within the buffer
                let d: *const dirent64 = unsafe { self.buffer.as_ptr().add(self.offset) as _ };

                debug_assert!(
                    d as usize % 8 == 0,
                    "the memory address of the dirent should be aligned to 8 bytes"
                );
                // SAFETY: d points at a complete record
                let reclen = unsafe { access_dirent!(d, d_reclen) };
                self.offset += reclen;

                // SAFETY: d is non null, it came from a successful read
                return Ok(Some(RawEntry {
                    ptr: unsafe { NonNull::new_unchecked(d.cast_mut()) },
                    _stream: core::marker::PhantomData,
                }));
            }

            if !self.fill_buffer()? {
                return Ok(None);
            }
        }
    }
}

impl core::fmt::Debug for DirStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DirStream")
            .field("fd", &self.fd)
            .field("offset", &self.offset)
            .field("remaining_bytes", &self.remaining_bytes)
            .field("end_of_stream", &self.end_of_stream)
            .finish()
    }
}

/**
 A borrowed view of one `dirent64` record inside a [`DirStream`] buffer.

 Valid until the stream's next refill, which the borrow on the stream
 enforces. Callers that outlive the borrow copy the name out.
*/
#[derive(Clone, Copy)]
pub struct RawEntry<'buf> {
    ptr: NonNull<dirent64>,
    _stream: core::marker::PhantomData<&'buf DirStream>,
}

impl RawEntry<'_> {
    /// The entry name as bytes, without the terminating NUL.
    #[must_use]
    #[inline]
    pub fn name_bytes(&self) -> &[u8] {
        // SAFETY: d_name is NUL terminated by the kernel; going through the
        // field offset keeps the access in bounds of the real record
        unsafe { CStr::from_ptr(access_dirent!(self.ptr.as_ptr(), d_name).cast()).to_bytes() }
    }

    /// The raw `d_type` byte (`DT_UNKNOWN` when the filesystem withholds it).
    #[must_use]
    #[inline]
    pub fn d_type(&self) -> u8 {
        // SAFETY: the pointer is valid while the buffer borrow lives
        unsafe { access_dirent!(self.ptr.as_ptr(), d_type) }
    }

    /// The inode number as reported by the directory stream.
    #[must_use]
    #[inline]
    pub fn ino(&self) -> u64 {
        // SAFETY: as above
        unsafe { access_dirent!(self.ptr.as_ptr(), d_ino) }
    }

    /// Whether this record names `.` or `..`.
    #[must_use]
    #[inline]
    pub fn is_dot_or_dot_dot(&self) -> bool {
        let ptr = self.ptr.as_ptr();
        let mut skip = false;
        skip_dot_or_dot_dot_entries!(ptr, skip = true);
        skip
    }
}

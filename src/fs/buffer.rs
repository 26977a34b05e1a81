use core::mem::MaybeUninit;

/**
 An 8-byte aligned buffer for `getdents64` batches.

 The kernel writes variable-length `dirent64` records into this storage, and
 each record's address must be 8-aligned for the field accesses to be legal.
 The contents are `MaybeUninit` so a fresh buffer costs no memset; only the
 prefix the kernel reported written is ever read back.

 # Type Parameters
 - `SIZE`: the fixed capacity of the buffer in bytes

 # Safety
 All reads go through [`filled`](Self::filled), which takes the byte count
 the kernel returned, so uninitialised tail bytes are never exposed.
*/
#[derive(Debug)]
#[repr(C, align(8))]
pub struct AlignedBuffer<const SIZE: usize> {
    data: MaybeUninit<[u8; SIZE]>,
}

#[allow(clippy::new_without_default)]
impl<const SIZE: usize> AlignedBuffer<SIZE> {
    /// Creates a new uninitialised aligned buffer.
    #[must_use]
    #[inline]
    pub const fn new() -> Self {
        Self {
            data: MaybeUninit::uninit(),
        }
    }

    /// Returns a mutable pointer to the buffer's data
    #[inline]
    #[must_use]
    pub const fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr().cast()
    }

    /// Returns a const pointer to the buffer's data
    #[inline]
    #[must_use]
    pub const fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr().cast()
    }

    /// Total capacity in bytes.
    #[inline]
    #[must_use]
    pub const fn max_capacity(&self) -> usize {
        SIZE
    }

    /**
     Returns the prefix of the buffer the kernel has filled.

     # Safety
     `len` must not exceed the byte count actually written by the most
     recent syscall into this buffer.
    */
    #[inline]
    pub const unsafe fn filled(&self, len: usize) -> &[u8] {
        debug_assert!(len <= SIZE, "filled() length exceeds buffer capacity");
        // SAFETY: caller guarantees the first `len` bytes are initialised
        unsafe { core::slice::from_raw_parts(self.as_ptr(), len) }
    }
}

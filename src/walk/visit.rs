use crate::fs::{Errno, FileStat, FileType, fstatat};
use crate::walk::VisitKind;
use core::cell::Cell;
use core::ffi::CStr;

/**
 Per-entry memoization of stat results, keyed by follow behaviour.

 Two independent slots: dereferencing and not dereferencing a symlink are
 different questions with different answers, and one visit may legally ask
 both. Errors memoize exactly like successes so a failing entry costs one
 syscall, not one per query. The cache belongs to a single entry payload;
 cross-entry reuse is deliberately not attempted.
*/
#[derive(Debug, Default)]
pub struct StatCache {
    follow: Cell<Option<Result<FileStat, Errno>>>,
    nofollow: Cell<Option<Result<FileStat, Errno>>>,
}

impl StatCache {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            follow: Cell::new(None),
            nofollow: Cell::new(None),
        }
    }

    /// Resets both slots for the next entry.
    #[inline]
    pub fn clear(&self) {
        self.follow.set(None);
        self.nofollow.set(None);
    }

    #[inline]
    fn slot(&self, follow: bool) -> &Cell<Option<Result<FileStat, Errno>>> {
        if follow { &self.follow } else { &self.nofollow }
    }

    /// The memoized result for `follow`, if any syscall has run yet.
    #[must_use]
    #[inline]
    pub fn cached(&self, follow: bool) -> Option<Result<FileStat, Errno>> {
        self.slot(follow).get()
    }

    /// Seeds a slot with a result obtained elsewhere (asynchronous prefetch,
    /// root resolution).
    #[inline]
    pub fn prime(&self, follow: bool, result: Result<FileStat, Errno>) {
        self.slot(follow).set(Some(result));
    }

    /// The memoized result for `follow`, running `fstatat(dirfd, path)` at
    /// most once per slot.
    #[inline]
    pub fn fetch(
        &self,
        follow: bool,
        dirfd: i32,
        path: *const core::ffi::c_char,
    ) -> Result<FileStat, Errno> {
        if let Some(result) = self.slot(follow).get() {
            return result;
        }
        let result = fstatat(dirfd, path, follow);
        self.slot(follow).set(Some(result));
        result
    }
}

/**
 The payload handed to the visit callback, one per visited entry.

 Everything here is borrowed from traversal-owned buffers and is only valid
 for the duration of the callback; consumers that keep data copy it out.
 The `(at_fd, at_path, at_flags)` triple resolves the entry for any `*at`
 syscall the consumer wants to make itself.
*/
#[derive(Debug)]
pub struct Visit<'walk> {
    pub(crate) path: &'walk [u8],
    pub(crate) name_offset: usize,
    pub(crate) root: &'walk [u8],
    pub(crate) depth: u32,
    pub(crate) kind: VisitKind,
    pub(crate) file_type: FileType,
    pub(crate) error: Option<Errno>,
    pub(crate) at_fd: i32,
    pub(crate) at_path: &'walk CStr,
    pub(crate) at_flags: i32,
    pub(crate) caches: &'walk StatCache,
}

impl<'walk> Visit<'walk> {
    /// Full path of the entry, from the root path as the caller gave it.
    #[must_use]
    #[inline]
    pub const fn path(&self) -> &'walk [u8] {
        self.path
    }

    /// The entry's own name (the tail of [`path`](Self::path)).
    #[must_use]
    #[inline]
    pub fn name(&self) -> &'walk [u8] {
        &self.path[self.name_offset..]
    }

    /// Byte offset at which [`name`](Self::name) starts inside the path.
    #[must_use]
    #[inline]
    pub const fn name_offset(&self) -> usize {
        self.name_offset
    }

    /// The root path this entry was reached from.
    #[must_use]
    #[inline]
    pub const fn root(&self) -> &'walk [u8] {
        self.root
    }

    /// Depth below the root; the root itself is 0.
    #[must_use]
    #[inline]
    pub const fn depth(&self) -> u32 {
        self.depth
    }

    /// Pre- or post-order.
    #[must_use]
    #[inline]
    pub const fn kind(&self) -> VisitKind {
        self.kind
    }

    /// Entry type as known so far; [`FileType::Error`] for error visits,
    /// [`FileType::Unknown`] when the filesystem withheld `d_type` and no
    /// stat has run.
    #[must_use]
    #[inline]
    pub const fn file_type(&self) -> FileType {
        self.file_type
    }

    /// The errno responsible for an error visit, `None` otherwise.
    #[must_use]
    #[inline]
    pub const fn error(&self) -> Option<Errno> {
        self.error
    }

    /// Directory descriptor for `*at` calls on this entry.
    #[must_use]
    #[inline]
    pub const fn at_fd(&self) -> i32 {
        self.at_fd
    }

    /// Path of this entry relative to [`at_fd`](Self::at_fd).
    #[must_use]
    #[inline]
    pub const fn at_path(&self) -> &'walk CStr {
        self.at_path
    }

    /// The `AT_*` flags matching the traversal's symlink policy.
    #[must_use]
    #[inline]
    pub const fn at_flags(&self) -> i32 {
        self.at_flags
    }

    /// Stat data for this entry, memoized per visit. `follow` selects
    /// whether a trailing symlink is dereferenced.
    #[inline]
    pub fn stat(&self, follow: bool) -> Result<FileStat, Errno> {
        self.caches.fetch(follow, self.at_fd, self.at_path.as_ptr())
    }

    /// Stat with the traversal's default symlink policy.
    #[inline]
    pub fn stat_default(&self) -> Result<FileStat, Errno> {
        self.stat(self.at_flags & libc::AT_SYMLINK_NOFOLLOW == 0)
    }

    /**
     Follow stat with broken-symlink fallback.

     A follow attempt that fails with `ENOENT`, `ENOTDIR` or `ELOOP` means
     the link itself exists but its target does not resolve; those retry
     without following and return the link's own data instead.
    */
    #[inline]
    pub fn stat_try_follow(&self) -> Result<FileStat, Errno> {
        match self.stat(true) {
            Err(errno) if matches!(errno, libc::ENOENT | libc::ENOTDIR | libc::ELOOP) => {
                self.stat(false)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    fn cstring(path: &std::path::Path) -> CString {
        CString::new(path.as_os_str().as_bytes()).unwrap()
    }

    #[test]
    fn identical_queries_collapse_and_memoize() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        let path = cstring(&dir.path().join("f"));

        let cache = StatCache::new();
        assert!(cache.cached(false).is_none());
        let first = cache.fetch(false, libc::AT_FDCWD, path.as_ptr()).unwrap();

        // Unlink, then ask again: the cached record must answer.
        std::fs::remove_file(dir.path().join("f")).unwrap();
        let second = cache.fetch(false, libc::AT_FDCWD, path.as_ptr()).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.cached(false), Some(Ok(second)));
    }

    #[test]
    fn errors_memoize_like_successes() {
        let dir = tempfile::tempdir().unwrap();
        let path = cstring(&dir.path().join("missing"));

        let cache = StatCache::new();
        assert_eq!(
            cache.fetch(false, libc::AT_FDCWD, path.as_ptr()),
            Err(libc::ENOENT)
        );
        // Create the file afterwards: the memoized error must still answer.
        std::fs::write(dir.path().join("missing"), b"x").unwrap();
        assert_eq!(
            cache.fetch(false, libc::AT_FDCWD, path.as_ptr()),
            Err(libc::ENOENT)
        );
        cache.clear();
        assert!(cache.fetch(false, libc::AT_FDCWD, path.as_ptr()).is_ok());
    }

    #[test]
    fn follow_and_nofollow_slots_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("target"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("target"), dir.path().join("link")).unwrap();
        let path = cstring(&dir.path().join("link"));

        let cache = StatCache::new();
        let linkstat = cache.fetch(false, libc::AT_FDCWD, path.as_ptr()).unwrap();
        let target = cache.fetch(true, libc::AT_FDCWD, path.as_ptr()).unwrap();
        assert_eq!(linkstat.file_type(), crate::fs::FileType::Symlink);
        assert_eq!(target.file_type(), crate::fs::FileType::RegularFile);
    }
}

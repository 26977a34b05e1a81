use crate::fs::{DirStream, Errno, FileDes};
use crate::tree::{Arena, FdCache, NodeId};

/// One directory entry copied out of the kernel batch buffer, owned by the
/// engine so the visit machinery can outlive the stream's refills.
#[derive(Debug, Default, Clone)]
pub(crate) struct EntryRec {
    pub name: Vec<u8>,
    pub d_type: u8,
    pub ino: u64,
}

/**
 The transient holder of a directory handle while one directory streams.

 Reads through a close-on-exec dup of the node's cached descriptor: the
 original stays in the cache as an `openat` base for children, and the
 reading handle can be closed aggressively (or shipped to the I/O queue for
 closing) without disturbing it.

 The first open or read error latches; iteration reports end-of-directory
 and [`take_error`](Self::take_error) hands the errno back so the engine can
 synthesize a post-order error visit.

 Only one reader exists per traversal at a time, which is what makes the
 shared path buffer reuse in the engine safe.
*/
#[derive(Debug)]
pub(crate) struct Reader {
    node: NodeId,
    stream: Option<DirStream>,
    error: Option<Errno>,
    batch: Vec<EntryRec>,
    batch_pos: usize,
    batched: bool,
}

impl Reader {
    /**
     Opens a reader over `node`, whose descriptor must already be cached.

     The dup is where descriptor pressure shows up when the cache is at its
     ceiling, so `EMFILE`/`ENFILE` evicts one entry (sparing `node`),
     ratchets the cache down and retries once.
    */
    pub(crate) fn open(arena: &mut Arena, cache: &mut FdCache, node: NodeId) -> Self {
        let dup = Self::dup_node_fd(arena, cache, node);
        match dup {
            Ok(fd) => Self {
                node,
                stream: Some(DirStream::new(fd)),
                error: None,
                batch: Vec::new(),
                batch_pos: 0,
                batched: false,
            },
            Err(errno) => Self {
                node,
                stream: None,
                error: Some(errno),
                batch: Vec::new(),
                batch_pos: 0,
                batched: false,
            },
        }
    }

    fn dup_node_fd(arena: &mut Arena, cache: &mut FdCache, node: NodeId) -> Result<FileDes, Errno> {
        let first = match arena.get(node).fd {
            Some(ref fd) => fd.dup_cloexec(),
            None => return Err(libc::EBADF),
        };
        match first {
            Err(errno) if errno == libc::EMFILE || errno == libc::ENFILE => {
                if !cache.evict_one(arena, Some(node)) {
                    return Err(errno);
                }
                cache.shrink_to_len();
                match arena.get(node).fd {
                    Some(ref fd) => fd.dup_cloexec(),
                    None => Err(libc::EBADF),
                }
            }
            other => other,
        }
    }

    /// The node this reader is streaming.
    #[inline]
    pub(crate) const fn node(&self) -> NodeId {
        self.node
    }

    /// Raw descriptor of the reading handle, for `*at` resolution of the
    /// current entry. Falls back to `AT_FDCWD` when the open failed.
    #[inline]
    pub(crate) fn at_fd(&self) -> i32 {
        self.stream
            .as_ref()
            .map_or(libc::AT_FDCWD, |stream| stream.dirfd().as_raw())
    }

    /// Whether the open itself failed (no entries will ever be produced).
    #[inline]
    pub(crate) const fn failed_open(&self) -> bool {
        self.stream.is_none() && self.error.is_some() && !self.batched
    }

    /**
     Drains every remaining entry into an owned batch, optionally sorting it
     byte-lexicographically by name. Read errors latch as usual and simply
     truncate the batch.
    */
    pub(crate) fn drain_into_batch(&mut self, sort: bool) {
        self.batched = true;
        let Some(ref mut stream) = self.stream else {
            return;
        };
        loop {
            match stream.next_entry() {
                Ok(Some(raw)) => {
                    if raw.is_dot_or_dot_dot() {
                        continue;
                    }
                    self.batch.push(EntryRec {
                        name: raw.name_bytes().to_vec(),
                        d_type: raw.d_type(),
                        ino: raw.ino(),
                    });
                }
                Ok(None) => break,
                Err(errno) => {
                    self.error.get_or_insert(errno);
                    break;
                }
            }
        }
        if sort {
            self.batch.sort_by(|a, b| a.name.cmp(&b.name));
        }
    }

    /// Discards the rest of a drained batch (the `prune-siblings` case).
    #[inline]
    pub(crate) fn abandon_batch(&mut self) {
        self.batch_pos = self.batch.len();
    }

    /// The drained entries (empty unless [`drain_into_batch`] ran).
    ///
    /// [`drain_into_batch`]: Self::drain_into_batch
    #[inline]
    pub(crate) fn batch(&self) -> &[EntryRec] {
        &self.batch
    }

    /**
     Copies the next entry into `out`. Returns `false` at end of directory;
     dot entries never surface. Streaming and batched modes share this
     interface so the engine iterates identically either way.
    */
    pub(crate) fn next(&mut self, out: &mut EntryRec) -> bool {
        if self.batched {
            if let Some(rec) = self.batch.get(self.batch_pos) {
                out.name.clear();
                out.name.extend_from_slice(&rec.name);
                out.d_type = rec.d_type;
                out.ino = rec.ino;
                self.batch_pos += 1;
                return true;
            }
            return false;
        }

        let Some(ref mut stream) = self.stream else {
            return false;
        };
        loop {
            match stream.next_entry() {
                Ok(Some(raw)) => {
                    if raw.is_dot_or_dot_dot() {
                        continue;
                    }
                    out.name.clear();
                    out.name.extend_from_slice(raw.name_bytes());
                    out.d_type = raw.d_type();
                    out.ino = raw.ino();
                    return true;
                }
                Ok(None) => return false,
                Err(errno) => {
                    self.error.get_or_insert(errno);
                    return false;
                }
            }
        }
    }

    /// The latched open/read error, if any.
    #[inline]
    pub(crate) fn take_error(&mut self) -> Option<Errno> {
        self.error.take()
    }

    /// Releases the reading handle, handing it to the caller so it can be
    /// closed inline or shipped to the I/O queue.
    #[inline]
    pub(crate) fn close(&mut self) -> Option<DirStream> {
        self.stream.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::ffi::OsStrExt;

    fn cached_node(arena: &mut Arena, cache: &mut FdCache, path: &std::path::Path) -> NodeId {
        let id = arena
            .alloc(None, 0, 0, path.as_os_str().as_bytes())
            .unwrap();
        cache.open_under(arena, id).unwrap();
        id
    }

    #[test]
    fn streams_entries_without_dots() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["one", "two", "three"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let mut arena = Arena::new();
        let mut cache = FdCache::new(4);
        let node = cached_node(&mut arena, &mut cache, dir.path());

        let mut reader = Reader::open(&mut arena, &mut cache, node);
        assert!(!reader.failed_open());

        let mut rec = EntryRec::default();
        let mut names = Vec::new();
        while reader.next(&mut rec) {
            names.push(rec.name.clone());
        }
        names.sort();
        assert_eq!(names, vec![b"one".to_vec(), b"three".to_vec(), b"two".to_vec()]);
        assert!(reader.take_error().is_none());
    }

    #[test]
    fn batch_mode_sorts_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["zeta", "alpha", "mid"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let mut arena = Arena::new();
        let mut cache = FdCache::new(4);
        let node = cached_node(&mut arena, &mut cache, dir.path());

        let mut reader = Reader::open(&mut arena, &mut cache, node);
        reader.drain_into_batch(true);

        let mut rec = EntryRec::default();
        let mut names = Vec::new();
        while reader.next(&mut rec) {
            names.push(rec.name.clone());
        }
        assert_eq!(names, vec![b"alpha".to_vec(), b"mid".to_vec(), b"zeta".to_vec()]);
    }

    #[test]
    fn reading_through_the_dup_leaves_the_cached_fd_usable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let mut arena = Arena::new();
        let mut cache = FdCache::new(4);
        let node = cached_node(&mut arena, &mut cache, dir.path());

        let mut reader = Reader::open(&mut arena, &mut cache, node);
        let mut rec = EntryRec::default();
        assert!(reader.next(&mut rec));
        drop(reader.close());

        // The node's original descriptor must still work as an openat base.
        let parent_len = arena.get(node).path_len();
        let child = arena.alloc(Some(node), parent_len, 1, b"sub").unwrap();
        cache.open_under(&mut arena, child).unwrap();
        assert!(arena.get(child).fd.is_some());
    }
}

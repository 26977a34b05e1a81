use crate::fs::{CPathBuf, Errno, FileDes};
use crate::tree::{Arena, DirNode, NO_HEAP_INDEX, NodeId};

/**
 The bounded cache of directories currently holding an open descriptor.

 A binary min-heap ordered by (depth descending, refcount ascending): the
 heap root is the deepest, least-referenced open directory and therefore the
 eviction victim, which keeps shallow, widely-shared ancestors open longest
 so children can keep composing `openat` from them.

 The heap stores ids only; each node carries its own `heap_index` so
 membership checks and removals are O(1) lookups plus a rebalance.

 Descriptor pressure is handled here, not by callers: a full cache evicts
 before opening, `ENAMETOOLONG` re-drives an open component by component
 (caching every intermediate descriptor, which permanently shortens future
 opens under that ancestor), and `EMFILE`/`ENFILE` shrinks the stated
 capacity to the observed equilibrium and retries once.
*/
#[derive(Debug)]
pub(crate) struct FdCache {
    heap: Vec<NodeId>,
    capacity: usize,
    /// Scratch for composing NUL-terminated relative paths for `openat`
    scratch: CPathBuf,
}

impl FdCache {
    #[must_use]
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            scratch: CPathBuf::new(),
        }
    }

    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Heap ordering: `a` is a better eviction candidate than `b`.
    /// Deeper first; ties prefer the smaller reference count.
    #[inline]
    fn precedes(a: &DirNode, b: &DirNode) -> bool {
        if a.depth != b.depth {
            a.depth > b.depth
        } else {
            a.refcount <= b.refcount
        }
    }

    #[inline]
    fn swap(&mut self, arena: &mut Arena, a: usize, b: usize) {
        self.heap.swap(a, b);
        arena.get_mut(self.heap[a]).heap_index = a;
        arena.get_mut(self.heap[b]).heap_index = b;
    }

    fn bubble_up(&mut self, arena: &mut Arena, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if Self::precedes(arena.get(self.heap[parent]), arena.get(self.heap[i])) {
                break;
            }
            self.swap(arena, parent, i);
            i = parent;
        }
    }

    fn bubble_down(&mut self, arena: &mut Arena, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut best = i;
            if left < self.heap.len()
                && Self::precedes(arena.get(self.heap[left]), arena.get(self.heap[best]))
            {
                best = left;
            }
            if right < self.heap.len()
                && Self::precedes(arena.get(self.heap[right]), arena.get(self.heap[best]))
            {
                best = right;
            }
            if best == i {
                break;
            }
            self.swap(arena, i, best);
            i = best;
        }
    }

    /// Admits a descriptor opened elsewhere (the async prefetch path),
    /// evicting first if the cache is at capacity.
    pub(crate) fn admit(&mut self, arena: &mut Arena, id: NodeId, fd: FileDes) {
        if self.heap.len() >= self.capacity {
            self.evict_one(arena, None);
        }
        self.attach(arena, id, fd);
    }

    /// Attaches an open descriptor to `id` and admits it to the heap.
    fn attach(&mut self, arena: &mut Arena, id: NodeId, fd: FileDes) {
        let index = self.heap.len();
        {
            let node = arena.get_mut(id);
            debug_assert!(node.fd.is_none(), "attach over a live descriptor");
            node.fd = Some(fd);
            node.heap_index = index;
        }
        self.heap.push(id);
        self.bubble_up(arena, index);
    }

    /// Detaches `id` from the heap and hands back its descriptor.
    /// The last element fills the hole and is rebalanced in whichever
    /// direction the ordering warrants.
    pub(crate) fn detach(&mut self, arena: &mut Arena, id: NodeId) -> Option<FileDes> {
        let index = arena.get(id).heap_index;
        if index == NO_HEAP_INDEX {
            return None;
        }

        let last = self.heap.len() - 1;
        if index != last {
            self.swap(arena, index, last);
        }
        self.heap.pop();
        let fd = {
            let node = arena.get_mut(id);
            node.heap_index = NO_HEAP_INDEX;
            node.fd.take()
        };
        if index < self.heap.len() {
            self.bubble_up(arena, index);
            self.bubble_down(arena, index);
        }
        fd
    }

    /// Closes the best eviction candidate, sparing `except` and any node
    /// pinned by an in-flight async open. Returns `false` when nothing is
    /// evictable.
    pub(crate) fn evict_one(&mut self, arena: &mut Arena, except: Option<NodeId>) -> bool {
        let eligible = |arena: &Arena, id: NodeId| Some(id) != except && arena.get(id).pinned == 0;

        let victim = match self.heap.first().copied() {
            Some(root) if eligible(arena, root) => Some(root),
            Some(_) => {
                // Fall back to a scan; the heap is small (bounded by the
                // descriptor budget) and this path only runs under pressure.
                let mut best: Option<NodeId> = None;
                for &id in &self.heap {
                    if !eligible(arena, id) {
                        continue;
                    }
                    best = match best {
                        Some(cur) if Self::precedes(arena.get(cur), arena.get(id)) => Some(cur),
                        _ => Some(id),
                    };
                }
                best
            }
            None => None,
        };

        match victim {
            Some(id) => {
                // Descriptor closes when the detached FileDes drops.
                self.detach(arena, id);
                true
            }
            None => false,
        }
    }

    /// Bumps `id`'s reference count. A busier node is a worse eviction
    /// candidate, so it sinks toward the heap leaves.
    pub(crate) fn incref(&mut self, arena: &mut Arena, id: NodeId) {
        let index = {
            let node = arena.get_mut(id);
            node.refcount += 1;
            node.heap_index
        };
        if index != NO_HEAP_INDEX {
            self.bubble_down(arena, index);
        }
    }

    /// Drops one reference from `id`, returning the remaining count. A less
    /// referenced node is a better eviction candidate, so it rises.
    pub(crate) fn decref(&mut self, arena: &mut Arena, id: NodeId) -> u32 {
        let (index, remaining) = {
            let node = arena.get_mut(id);
            debug_assert!(node.refcount > 0, "decref through zero");
            node.refcount -= 1;
            (node.heap_index, node.refcount)
        };
        if index != NO_HEAP_INDEX {
            self.bubble_up(arena, index);
        }
        remaining
    }

    /// Ratchets the capacity down to the current population. Called when the
    /// process runs out of descriptors: the new ceiling is the equilibrium
    /// with whatever else in the process is consuming them.
    pub(crate) fn shrink_to_len(&mut self) {
        self.capacity = self.heap.len().max(1);
    }

    /// Raw descriptor of the nearest open ancestor, or `AT_FDCWD`.
    fn base_raw(arena: &Arena, base: Option<NodeId>) -> i32 {
        match base {
            Some(id) => match arena.get(id).fd {
                Some(ref fd) => fd.as_raw(),
                None => libc::AT_FDCWD,
            },
            None => libc::AT_FDCWD,
        }
    }

    /// One `openat` with local `EMFILE`/`ENFILE` recovery: evict someone
    /// other than `keep`, ratchet capacity, retry once.
    fn open_at_recovering(
        &mut self,
        arena: &mut Arena,
        base: Option<NodeId>,
        keep: Option<NodeId>,
    ) -> Result<FileDes, Errno> {
        match FileDes::open_dir_at(Self::base_raw(arena, base), self.scratch.as_ptr()) {
            Err(errno) if errno == libc::EMFILE || errno == libc::ENFILE => {
                if !self.evict_one(arena, keep.or(base)) {
                    return Err(errno);
                }
                self.shrink_to_len();
                FileDes::open_dir_at(Self::base_raw(arena, base), self.scratch.as_ptr())
            }
            other => other,
        }
    }

    /**
     Opens the directory for `id`, composing `openat` from the nearest open
     ancestor, and admits the descriptor to the heap.

     With no open ancestor the base is the process working directory and the
     relative path is the full path rebuilt from the root. A path the kernel
     rejects with `ENAMETOOLONG` is re-driven component by component from
     the base, caching each intermediate descriptor along the way.
    */
    pub(crate) fn open_under(&mut self, arena: &mut Arena, id: NodeId) -> Result<(), Errno> {
        if arena.get(id).fd.is_some() {
            return Ok(());
        }

        let base = arena.find_ancestor(id, |node| node.fd.is_some());

        // Chain of nodes between the base (exclusive) and the target
        // (inclusive), top-down. Segments carry their own trailing slash, so
        // the relative path is their plain concatenation.
        let chain = self.chain_below(arena, base, id);

        self.scratch.set(b"");
        for &link in &chain {
            let segment: &[u8] = &arena.get(link).name;
            self.scratch.push_segment(segment);
        }

        // Make room before the syscall; the base must survive the eviction.
        if self.heap.len() >= self.capacity {
            self.evict_one(arena, base);
        }

        match self.open_at_recovering(arena, base, None) {
            Ok(fd) => {
                self.attach(arena, id, fd);
                Ok(())
            }
            Err(errno) if errno == libc::ENAMETOOLONG => self.open_components(arena, base, &chain),
            Err(errno) => Err(errno),
        }
    }

    /// Collects the node chain from `base` (exclusive) down to `id`
    /// (inclusive), in root-to-leaf order.
    fn chain_below(&self, arena: &Arena, base: Option<NodeId>, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut cur = Some(id);
        while let Some(link) = cur {
            if Some(link) == base {
                break;
            }
            chain.push(link);
            cur = arena.get(link).parent;
        }
        chain.reverse();
        chain
    }

    /// The `ENAMETOOLONG` fallback: open every chain component in turn,
    /// each from the previous descriptor, caching all of them. Future opens
    /// below this ancestor then start from a much closer base.
    fn open_components(
        &mut self,
        arena: &mut Arena,
        base: Option<NodeId>,
        chain: &[NodeId],
    ) -> Result<(), Errno> {
        let mut prev = base;
        for &link in chain {
            if arena.get(link).fd.is_some() {
                prev = Some(link);
                continue;
            }

            let segment: &[u8] = &arena.get(link).name;
            // Borrow dance: copy the segment out before touching scratch.
            let segment = segment.to_vec();
            self.scratch.set(&segment);

            if self.heap.len() >= self.capacity {
                self.evict_one(arena, prev);
            }

            let fd = self.open_at_recovering(arena, prev, None)?;
            self.attach(arena, link, fd);
            prev = Some(link);
        }
        Ok(())
    }

    /// Closes every cached descriptor. Used for teardown after `stop` or a
    /// fatal error; node bookkeeping is reset so the arena can be drained.
    pub(crate) fn destroy(&mut self, arena: &mut Arena) {
        while let Some(&id) = self.heap.first() {
            self.detach(arena, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::CPathBuf;

    fn open_dot() -> FileDes {
        let mut path = CPathBuf::new();
        path.set(b".");
        FileDes::open_dir_at(libc::AT_FDCWD, path.as_ptr()).unwrap()
    }

    fn node_at(arena: &mut Arena, depth: u32, refcount: u32) -> NodeId {
        let id = arena.alloc(None, 0, depth, b"n").unwrap();
        arena.get_mut(id).refcount = refcount;
        id
    }

    #[test]
    fn heap_root_is_deepest_least_referenced() {
        let mut arena = Arena::new();
        let mut cache = FdCache::new(16);

        let shallow = node_at(&mut arena, 1, 5);
        let deep_busy = node_at(&mut arena, 4, 9);
        let deep_idle = node_at(&mut arena, 4, 2);

        for id in [shallow, deep_busy, deep_idle] {
            cache.attach(&mut arena, id, open_dot());
        }

        assert_eq!(cache.heap[0], deep_idle);
        // Evicting removes the deep idle node first, then the deep busy one.
        assert!(cache.evict_one(&mut arena, None));
        assert_eq!(cache.heap[0], deep_busy);
        assert!(arena.get(deep_idle).fd.is_none());
        assert_eq!(arena.get(deep_idle).heap_index, NO_HEAP_INDEX);
    }

    #[test]
    fn incref_sinks_and_decref_rises() {
        let mut arena = Arena::new();
        let mut cache = FdCache::new(16);

        let a = node_at(&mut arena, 3, 1);
        let b = node_at(&mut arena, 3, 2);
        cache.attach(&mut arena, a, open_dot());
        cache.attach(&mut arena, b, open_dot());
        assert_eq!(cache.heap[0], a);

        // a gets busier than b: b should now be the eviction candidate.
        cache.incref(&mut arena, a);
        cache.incref(&mut arena, a);
        assert_eq!(cache.heap[0], b);

        // and back again.
        cache.decref(&mut arena, a);
        cache.decref(&mut arena, a);
        assert_eq!(cache.heap[0], a);
    }

    #[test]
    fn evict_spares_the_pinned_node() {
        let mut arena = Arena::new();
        let mut cache = FdCache::new(16);

        let pinned = node_at(&mut arena, 5, 1);
        let other = node_at(&mut arena, 2, 1);
        cache.attach(&mut arena, pinned, open_dot());
        cache.attach(&mut arena, other, open_dot());

        assert_eq!(cache.heap[0], pinned);
        assert!(cache.evict_one(&mut arena, Some(pinned)));
        assert!(arena.get(pinned).fd.is_some());
        assert!(arena.get(other).fd.is_none());

        // Only the pinned node left: eviction must refuse.
        assert!(!cache.evict_one(&mut arena, Some(pinned)));
    }

    #[test]
    fn shrink_ratchets_capacity() {
        let mut arena = Arena::new();
        let mut cache = FdCache::new(64);
        let id = node_at(&mut arena, 1, 1);
        cache.attach(&mut arena, id, open_dot());
        cache.shrink_to_len();
        assert_eq!(cache.capacity(), 1);
        cache.destroy(&mut arena);
        cache.shrink_to_len();
        assert_eq!(cache.capacity(), 1);
    }
}

use crate::error::{Result, TraversalError};
use crate::fs::{DT_WHT_RAW, Errno, FileDes, FileStat, FileType, fstatat};
use crate::ioq::{Ioq, IoqOp, IoqOutput, IoqRequest, RING_SLOTS};
use crate::tree::{Arena, FdCache, NodeId, QueueOrder, VisitQueue};
use crate::walk::reader::{EntryRec, Reader};
use crate::walk::visit::{StatCache, Visit};
use crate::walk::{Strategy, VisitAction, VisitKind, WalkOptions};
use core::ffi::CStr;
use std::collections::{HashMap, HashSet};
use std::os::unix::ffi::OsStrExt;

/// Per-entry control flow inside one directory.
enum Flow {
    Continue,
    PruneSiblings,
}

/// Entry point behind [`crate::walk::walk`]: validates the configuration and
/// dispatches to the single-pass or deepening drivers.
pub(crate) fn walk_with(
    opts: &WalkOptions,
    callback: &mut dyn FnMut(&Visit<'_>) -> VisitAction,
) -> Result<()> {
    if opts.paths.is_empty() {
        return Err(TraversalError::EmptyRoots);
    }
    if opts.max_open_fd < 2 {
        return Err(TraversalError::DescriptorBudget(opts.max_open_fd));
    }

    match opts.strategy {
        Strategy::Bfs | Strategy::Dfs => {
            let order = if opts.strategy == Strategy::Bfs {
                QueueOrder::Fifo
            } else {
                QueueOrder::Lifo
            };
            let mut engine = Engine::new(opts, callback, order);
            engine.pass_ceiling = opts.max_depth;
            engine.emit_post = opts.flags.post_order;
            engine.run_pass()
        }
        Strategy::IterativeDeepening | Strategy::ExponentialDeepening => {
            run_deepening(opts, callback)
        }
    }
}

/**
 Deepening driver: depth-first passes with a growing ceiling.

 Pass k only reports entries in the depth window `(previous ceiling, ceiling]`
 so nothing is visited twice across passes. Once a pass completes without its
 ceiling suppressing a descent the tree is exhausted; post-order visits, if
 requested, then run as one extra full pass with an empty pre window.
*/
fn run_deepening(
    opts: &WalkOptions,
    callback: &mut dyn FnMut(&Visit<'_>) -> VisitAction,
) -> Result<()> {
    let mut floor = 0u32;
    let mut limit = 1u32;

    loop {
        let ceiling = opts.max_depth.map_or(limit, |max| limit.min(max));
        // Only a pass bounded by its own limit (not the caller's max_depth)
        // can justify another round.
        let pass_bounded = opts.max_depth.is_none_or(|max| limit < max);

        let mut engine = Engine::new(opts, callback, QueueOrder::Lifo);
        engine.pass_floor = floor;
        engine.pass_ceiling = Some(ceiling);
        engine.ceiling_counts = pass_bounded;
        engine.run_pass()?;

        if engine.stopped {
            return Ok(());
        }
        if !engine.limited {
            if opts.flags.post_order {
                let mut post = Engine::new(opts, callback, QueueOrder::Lifo);
                post.pass_ceiling = Some(ceiling);
                post.emit_pre = false;
                post.emit_post = true;
                post.run_pass()?;
            }
            return Ok(());
        }

        floor = ceiling + 1;
        limit = match opts.strategy {
            Strategy::ExponentialDeepening => limit.saturating_mul(2),
            _ => limit.saturating_add(1),
        };
    }
}

/**
 One traversal pass.

 Single-threaded and cooperative: owns the node arena, the descriptor cache,
 the pending queue and the (at most one) reader. The optional I/O queue only
 ever sees raw descriptors and byte paths; its workers never touch any of
 this state.
*/
struct Engine<'walk> {
    opts: &'walk WalkOptions,
    callback: &'walk mut dyn FnMut(&Visit<'_>) -> VisitAction,
    arena: Arena,
    cache: FdCache,
    queue: VisitQueue,
    ioq: Option<Ioq>,
    /// Async open completions claimed out of order, keyed by node tag
    open_results: HashMap<u64, core::result::Result<FileDes, Errno>>,
    /// Nodes whose open is in flight or completed-but-unclaimed
    open_pending: HashSet<u64>,
    /// Batched stat prefetch results for the directory being iterated
    batch_stats: Vec<Option<core::result::Result<FileStat, Errno>>>,
    /// The one shared path reconstruction buffer
    path_buf: Vec<u8>,
    /// `at_path` scratch, always exactly one trailing NUL
    name_buf: Vec<u8>,
    /// Root path (as given) of the entry currently being visited
    cur_root: Vec<u8>,
    /// Live root nodes and their as-given spellings
    roots: Vec<(NodeId, Vec<u8>)>,
    stat_cache: StatCache,
    stopped: bool,
    /// A descent was suppressed by the pass ceiling
    limited: bool,
    /// Suppress pre/error visits below this depth (deepening windows)
    pass_floor: u32,
    /// Maximum visit depth; directories at the ceiling are not descended
    pass_ceiling: Option<u32>,
    /// Whether ceiling suppressions count as `limited`
    ceiling_counts: bool,
    emit_pre: bool,
    emit_post: bool,
    /// Outstanding async requests allowed; descriptors parked in completed
    /// opens count against `max_open_fd` just like cached ones
    prefetch_window: usize,
}

impl<'walk> Engine<'walk> {
    fn new(
        opts: &'walk WalkOptions,
        callback: &'walk mut dyn FnMut(&Visit<'_>) -> VisitAction,
        order: QueueOrder,
    ) -> Self {
        let ioq = (opts.n_threads > 0).then(|| Ioq::start(opts.n_threads));
        // One descriptor is reserved for the reader's dup and one per
        // possible outstanding async open.
        let prefetch_window = (RING_SLOTS - 1).min(opts.max_open_fd.saturating_sub(2).max(1));
        let reserve = 1 + if ioq.is_some() { prefetch_window } else { 0 };
        let capacity = opts.max_open_fd.saturating_sub(reserve).max(1);

        Self {
            opts,
            callback,
            arena: Arena::new(),
            cache: FdCache::new(capacity),
            queue: VisitQueue::new(order),
            ioq,
            open_results: HashMap::new(),
            open_pending: HashSet::new(),
            batch_stats: Vec::new(),
            path_buf: Vec::new(),
            name_buf: Vec::new(),
            cur_root: Vec::new(),
            roots: Vec::new(),
            stat_cache: StatCache::new(),
            stopped: false,
            limited: false,
            pass_floor: 0,
            pass_ceiling: None,
            ceiling_counts: false,
            emit_pre: true,
            emit_post: false,
            prefetch_window,
        }
    }

    #[inline]
    const fn tag(id: NodeId) -> u64 {
        id.index() as u64
    }

    #[inline]
    fn follow_flavor(&self) -> bool {
        self.opts.flags.follow_all
    }

    fn run_pass(&mut self) -> Result<()> {
        let outcome = self.run_pass_inner();
        self.teardown();
        outcome
    }

    fn run_pass_inner(&mut self) -> Result<()> {
        for index in 0..self.opts.paths.len() {
            if self.stopped {
                break;
            }
            self.prime_root(index)?;
        }
        while !self.stopped {
            let Some(id) = self.queue.pop(&mut self.arena) else {
                break;
            };
            self.expand(id)?;
        }
        Ok(())
    }

    /// Pre-root state: resolve the root, emit its pre (or error) visit, and
    /// queue it when it is a descendable directory.
    fn prime_root(&mut self, index: usize) -> Result<()> {
        let root_bytes = self.opts.paths[index].as_bytes().to_vec();
        let follow = self.opts.flags.follow_roots || self.opts.flags.follow_all;

        self.cur_root.clear();
        self.cur_root.extend_from_slice(&root_bytes);
        self.path_buf.clear();
        self.path_buf.extend_from_slice(&root_bytes);
        self.set_name_buf(&root_bytes);
        self.stat_cache.clear();

        // SAFETY: set_name_buf appended exactly one NUL
        let root_cstr = unsafe { CStr::from_bytes_with_nul_unchecked(&self.name_buf) };
        let stat = fstatat(libc::AT_FDCWD, root_cstr.as_ptr(), follow);
        self.stat_cache.prime(follow, stat);

        let name_offset = basename_offset(&root_bytes);
        let visible = self.emit_pre && self.pass_floor == 0 && self.opts.min_depth == 0;

        let stat = match stat {
            Err(errno) => {
                if visible {
                    let action =
                        self.invoke(VisitKind::Pre, 0, FileType::Error, Some(errno), name_offset, libc::AT_FDCWD);
                    if action == VisitAction::Stop {
                        self.stopped = true;
                        return Ok(());
                    }
                }
                if self.opts.flags.recover {
                    return Ok(());
                }
                self.stopped = true;
                return Err(TraversalError::from_errno(errno, &root_bytes));
            }
            Ok(stat) => stat,
        };

        let file_type = stat.file_type();
        if visible {
            let action =
                self.invoke(VisitKind::Pre, 0, file_type, None, name_offset, libc::AT_FDCWD);
            match action {
                VisitAction::Stop => {
                    self.stopped = true;
                    return Ok(());
                }
                VisitAction::PruneSubtree | VisitAction::PruneSiblings => {
                    if file_type.is_dir() {
                        self.post_for_undescended(0, name_offset, libc::AT_FDCWD);
                    }
                    return Ok(());
                }
                VisitAction::Continue => {}
            }
        }

        if !file_type.is_dir() {
            return Ok(());
        }
        if let Some(ceiling) = self.pass_ceiling {
            if ceiling == 0 {
                if self.ceiling_counts {
                    self.limited = true;
                }
                self.post_for_undescended(0, name_offset, libc::AT_FDCWD);
                return Ok(());
            }
        }

        let id = self.arena.alloc(None, 0, 0, &root_bytes)?;
        self.arena.get_mut(id).identity = Some(stat.identity());
        self.roots.push((id, root_bytes));
        self.queue.push(&mut self.arena, id);
        self.maybe_prefetch_open(id);
        Ok(())
    }

    /// Expanding + iterating + post states for one directory.
    fn expand(&mut self, id: NodeId) -> Result<()> {
        let opened: core::result::Result<(), Errno> = if self.open_pending.remove(&Self::tag(id)) {
            match self.claim_open(Self::tag(id)) {
                Ok(fd) => {
                    self.cache.admit(&mut self.arena, id, fd);
                    Ok(())
                }
                Err(errno) => Err(errno),
            }
        } else {
            self.cache.open_under(&mut self.arena, id)
        };

        if let Err(errno) = opened {
            return self.dir_error(id, errno);
        }

        let mut reader = Reader::open(&mut self.arena, &mut self.cache, id);
        if reader.failed_open() {
            let errno = reader.take_error().unwrap_or(libc::EIO);
            return self.dir_error(id, errno);
        }

        if self.opts.flags.batched() {
            reader.drain_into_batch(self.opts.flags.sort);
            self.prefetch_batch_stats(&reader);
        } else {
            self.batch_stats.clear();
        }

        self.set_cur_root(id);
        // Seed the shared buffer with this directory's slashed path; every
        // entry then truncates back to it and appends its own name.
        self.arena.write_path(id, &mut self.path_buf);
        let dir_path_len = self.arena.get(id).path_len();
        let dir_depth = self.arena.get(id).depth;
        let dir_device = self.arena.get(id).identity.map(|(dev, _)| dev);

        let mut rec = EntryRec::default();
        let mut index = 0usize;
        let mut iter_err: Option<TraversalError> = None;
        while !self.stopped && reader.next(&mut rec) {
            match self.process_entry(id, &rec, reader.at_fd(), dir_path_len, dir_depth, dir_device, index) {
                Ok(Flow::Continue) => {}
                Ok(Flow::PruneSiblings) => {
                    reader.abandon_batch();
                    break;
                }
                Err(err) => {
                    self.stopped = true;
                    iter_err = Some(err);
                    break;
                }
            }
            index += 1;
        }

        let sticky = reader.take_error();
        if let Some(stream) = reader.close() {
            match self.ioq {
                Some(ref mut ioq) => ioq.submit_close_dir(Self::tag(id), stream),
                None => drop(stream),
            }
        }
        drop(reader);

        if let Some(err) = iter_err {
            self.release(id);
            return Err(err);
        }
        if let Some(errno) = sticky {
            if !self.stopped {
                return self.dir_error(id, errno);
            }
        }
        self.release(id);
        Ok(())
    }

    /// One entry of the directory being iterated: filtering, path and
    /// payload assembly, callback dispatch, descent decision.
    #[allow(clippy::too_many_arguments)]
    fn process_entry(
        &mut self,
        parent: NodeId,
        rec: &EntryRec,
        at_fd: i32,
        dir_path_len: usize,
        dir_depth: u32,
        dir_device: Option<u64>,
        index: usize,
    ) -> Result<Flow> {
        if rec.d_type == DT_WHT_RAW && !self.opts.flags.whiteouts {
            return Ok(Flow::Continue);
        }

        let depth = dir_depth + 1;
        let flavor = self.follow_flavor();

        self.path_buf.truncate(dir_path_len);
        self.path_buf.extend_from_slice(&rec.name);
        self.set_name_buf(&rec.name);
        self.stat_cache.clear();
        if let Some(Some(prefetched)) = self.batch_stats.get(index) {
            self.stat_cache.prime(flavor, *prefetched);
        }

        let mut file_type = FileType::from_dtype(rec.d_type);
        if self.opts.flags.stat_every || file_type == FileType::Unknown {
            if let Ok(stat) = self.entry_stat_resolved(at_fd) {
                if file_type == FileType::Unknown {
                    file_type = stat.file_type();
                }
            }
        }
        if file_type == FileType::Symlink && flavor {
            // Follow policy reports the target's type; a broken link keeps
            // reporting itself (the try-follow fallback).
            if let Ok(stat) = self.entry_stat_resolved(at_fd) {
                file_type = stat.file_type();
            }
        }

        // Mount transitions need device identity before the visit, since
        // skip_mounts suppresses the visit itself.
        let mut mount_transition = false;
        if (self.opts.flags.skip_mounts || self.opts.flags.prune_mounts) && file_type.is_dir() {
            if let Ok(stat) = self.entry_stat_resolved(at_fd) {
                mount_transition = match dir_device {
                    Some(parent_dev) => stat.dev != parent_dev,
                    // No parent identity: fall back to the caller's mount list.
                    None => self
                        .opts
                        .mount_table
                        .as_ref()
                        .is_some_and(|table| table.contains(&stat.dev)),
                };
            }
            if mount_transition && self.opts.flags.skip_mounts {
                return Ok(Flow::Continue);
            }
        }

        let is_dir = file_type.is_dir();
        let visible = self.emit_pre && depth >= self.pass_floor && depth >= self.opts.min_depth;
        if visible {
            let action = self.invoke(VisitKind::Pre, depth, file_type, None, dir_path_len, at_fd);
            match action {
                VisitAction::Stop => {
                    self.stopped = true;
                    return Ok(Flow::Continue);
                }
                VisitAction::PruneSiblings => {
                    if is_dir {
                        self.post_for_undescended(depth, dir_path_len, at_fd);
                    }
                    return Ok(Flow::PruneSiblings);
                }
                VisitAction::PruneSubtree => {
                    if is_dir {
                        self.post_for_undescended(depth, dir_path_len, at_fd);
                    }
                    return Ok(Flow::Continue);
                }
                VisitAction::Continue => {}
            }
        }

        if !is_dir {
            return Ok(Flow::Continue);
        }
        if mount_transition && self.opts.flags.prune_mounts {
            self.post_for_undescended(depth, dir_path_len, at_fd);
            return Ok(Flow::Continue);
        }

        // The ceiling is the deepest reported level; directories there are
        // reported but not descended.
        let within_effective = match (self.pass_ceiling, self.opts.max_depth) {
            (Some(ceiling), _) => depth < ceiling,
            (None, Some(max)) => depth < max,
            (None, None) => true,
        };
        if !within_effective {
            if self.ceiling_counts
                && self
                    .pass_ceiling
                    .is_some_and(|c| self.opts.max_depth.is_none_or(|max| c < max))
            {
                self.limited = true;
            }
            self.post_for_undescended(depth, dir_path_len, at_fd);
            return Ok(Flow::Continue);
        }

        let identity = if self.opts.flags.needs_identity() {
            self.entry_stat_resolved(at_fd).ok().map(|stat| stat.identity())
        } else {
            None
        };

        if self.opts.flags.cycles_checked() {
            if let Some(identity) = identity {
                let hit = self.arena.get(parent).identity == Some(identity)
                    || self
                        .arena
                        .find_ancestor(parent, |node| node.identity == Some(identity))
                        .is_some();
                if hit {
                    return self.cycle_error(depth, dir_path_len, at_fd);
                }
            }
        }

        let child = self.arena.alloc(Some(parent), dir_path_len, depth, &rec.name)?;
        self.arena.get_mut(child).identity = identity;

        // Ancestor-chain reference propagation: every ancestor gains one
        // reference per live descendant.
        let mut ancestor = Some(parent);
        while let Some(a) = ancestor {
            self.cache.incref(&mut self.arena, a);
            ancestor = self.arena.get(a).parent;
        }

        self.queue.push(&mut self.arena, child);
        self.maybe_prefetch_open(child);
        Ok(Flow::Continue)
    }

    /// Entry stat with the traversal's follow policy, including the broken
    /// symlink fallback when following.
    fn entry_stat_resolved(&self, at_fd: i32) -> core::result::Result<FileStat, Errno> {
        // SAFETY: name_buf carries exactly one trailing NUL
        let path = unsafe { CStr::from_bytes_with_nul_unchecked(&self.name_buf) };
        let flavor = self.follow_flavor();
        match self.stat_cache.fetch(flavor, at_fd, path.as_ptr()) {
            Err(errno)
                if flavor && matches!(errno, libc::ENOENT | libc::ENOTDIR | libc::ELOOP) =>
            {
                self.stat_cache.fetch(false, at_fd, path.as_ptr())
            }
            other => other,
        }
    }

    /// A directory that was pre-visited but will not be descended into
    /// (pruned, a mount boundary, or at the depth ceiling) still owes its
    /// post-order visit; it is delivered immediately since there is nothing
    /// to wait for.
    fn post_for_undescended(&mut self, depth: u32, name_offset: usize, at_fd: i32) {
        if !self.emit_post || self.stopped || depth < self.opts.min_depth {
            return;
        }
        let action = self.invoke(VisitKind::Post, depth, FileType::Directory, None, name_offset, at_fd);
        if action == VisitAction::Stop {
            self.stopped = true;
        }
    }

    /// Synthesizes the `ELOOP` visit for a detected directory cycle. The
    /// subtree is pruned by simply not queueing the child.
    fn cycle_error(&mut self, depth: u32, name_offset: usize, at_fd: i32) -> Result<Flow> {
        let visible = self.emit_pre && depth >= self.pass_floor && depth >= self.opts.min_depth;
        if visible {
            let action = self.invoke(
                VisitKind::Pre,
                depth,
                FileType::Error,
                Some(libc::ELOOP),
                name_offset,
                at_fd,
            );
            if action == VisitAction::Stop {
                self.stopped = true;
                return Ok(Flow::Continue);
            }
            if !self.opts.flags.recover {
                self.stopped = true;
                return Err(TraversalError::from_errno(libc::ELOOP, &self.path_buf));
            }
            if action == VisitAction::PruneSiblings {
                self.post_for_undescended(depth, name_offset, at_fd);
                return Ok(Flow::PruneSiblings);
            }
        } else if !self.opts.flags.recover {
            self.stopped = true;
            return Err(TraversalError::from_errno(libc::ELOOP, &self.path_buf));
        }
        self.post_for_undescended(depth, name_offset, at_fd);
        Ok(Flow::Continue)
    }

    /**
     A directory whose open or read failed: emit a post-kind error visit
     (which satisfies its post-order obligation), release the node, and
     either continue (recovery) or terminate with the errno preserved.
    */
    fn dir_error(&mut self, id: NodeId, errno: Errno) -> Result<()> {
        let depth = self.arena.get(id).depth;
        let name_offset = self.arena.get(id).name_offset;
        let visible = self.emit_pre && depth >= self.pass_floor && depth >= self.opts.min_depth;

        self.arena.get_mut(id).post_visited = true;
        self.set_cur_root(id);
        self.prepare_dir_path(id);

        if visible {
            self.stat_cache.clear();
            let action = self.invoke(
                VisitKind::Post,
                depth,
                FileType::Error,
                Some(errno),
                name_offset,
                libc::AT_FDCWD,
            );
            if action == VisitAction::Stop {
                self.stopped = true;
            }
        }

        let failed_path = self.path_buf.clone();
        self.release(id);

        if self.opts.flags.recover || self.stopped {
            Ok(())
        } else {
            self.stopped = true;
            Err(TraversalError::from_errno(errno, &failed_path))
        }
    }

    /// Reconstructs `id`'s full path into the shared buffer without the
    /// trailing slash, and mirrors it into the `at_path` scratch.
    fn prepare_dir_path(&mut self, id: NodeId) {
        self.arena.write_path(id, &mut self.path_buf);
        if self.path_buf.len() > 1 && self.path_buf.last() == Some(&b'/') {
            self.path_buf.pop();
        }
        self.name_buf.clear();
        self.name_buf.extend_from_slice(&self.path_buf);
        self.name_buf.push(0);
    }

    /**
     Drops the engine's reference on `id` and cascades.

     Every node holds one reference on each of its ancestors, so a free
     walks the whole parent chain removing the freed subtree's
     contributions; the per-step decrement grows by one for every ancestor
     that itself reaches zero and is freed in the same pass.
    */
    fn release(&mut self, id: NodeId) {
        if self.cache.decref(&mut self.arena, id) > 0 {
            return;
        }
        let mut cur = self.free_node(id);
        let mut delta: u32 = 1;
        while let Some(ancestor) = cur {
            let mut remaining = 0;
            for _ in 0..delta {
                remaining = self.cache.decref(&mut self.arena, ancestor);
            }
            let parent = self.arena.get(ancestor).parent;
            if remaining == 0 {
                self.free_node(ancestor);
                delta += 1;
            }
            cur = parent;
        }
    }

    /// Emits the post-order visit owed by a node at refcount zero, closes
    /// its descriptor and frees its slot. Returns the parent.
    fn free_node(&mut self, id: NodeId) -> Option<NodeId> {
        let depth = self.arena.get(id).depth;
        let wants_post = self.emit_post
            && !self.stopped
            && !self.arena.get(id).post_visited
            && depth >= self.opts.min_depth;
        if wants_post {
            let name_offset = self.arena.get(id).name_offset;
            self.set_cur_root(id);
            self.prepare_dir_path(id);
            self.stat_cache.clear();
            let action = self.invoke(
                VisitKind::Post,
                depth,
                FileType::Directory,
                None,
                name_offset,
                libc::AT_FDCWD,
            );
            if action == VisitAction::Stop {
                self.stopped = true;
            }
        }

        self.cache.detach(&mut self.arena, id);
        let parent = self.arena.get(id).parent;
        if parent.is_none() {
            self.roots.retain(|&(root_id, _)| root_id != id);
        }
        self.arena.free(id);
        parent
    }

    /// Builds the payload from the prepared buffers and runs the callback.
    fn invoke(
        &mut self,
        kind: VisitKind,
        depth: u32,
        file_type: FileType,
        error: Option<Errno>,
        name_offset: usize,
        at_fd: i32,
    ) -> VisitAction {
        debug_assert!(self.name_buf.last() == Some(&0), "name_buf missing its NUL");
        // SAFETY: name_buf is rebuilt via set_name_buf/prepare_dir_path,
        // both of which append exactly one NUL to NUL-free bytes
        let at_path = unsafe { CStr::from_bytes_with_nul_unchecked(&self.name_buf) };
        let at_flags = if self.opts.flags.follow_all {
            0
        } else {
            libc::AT_SYMLINK_NOFOLLOW
        };

        let visit = Visit {
            path: &self.path_buf,
            name_offset,
            root: &self.cur_root,
            depth,
            kind,
            file_type,
            error,
            at_fd,
            at_path,
            at_flags,
            caches: &self.stat_cache,
        };
        (self.callback)(&visit)
    }

    #[inline]
    fn set_name_buf(&mut self, name: &[u8]) {
        self.name_buf.clear();
        self.name_buf.extend_from_slice(name);
        self.name_buf.push(0);
    }

    /// Loads the as-given root spelling for the root owning `id`.
    fn set_cur_root(&mut self, id: NodeId) {
        let mut root = id;
        while let Some(parent) = self.arena.get(root).parent {
            root = parent;
        }
        if let Some(position) = self.roots.iter().position(|&(root_id, _)| root_id == root) {
            let spelling = self.roots[position].1.clone();
            self.cur_root = spelling;
        }
    }

    /// Issues an asynchronous open for a freshly queued directory, pinning
    /// the base descriptor for the request's lifetime.
    fn maybe_prefetch_open(&mut self, id: NodeId) {
        if self.ioq.is_none() {
            return;
        }
        // Stay inside the prefetch window so parked descriptors respect the
        // budget and submission can never wedge against a full ready ring.
        while self
            .ioq
            .as_ref()
            .is_some_and(|ioq| ioq.in_flight() >= self.prefetch_window)
        {
            if !self.consume_one_async(true) {
                return;
            }
        }

        let parent = self.arena.get(id).parent;
        let base = parent.filter(|&p| self.arena.get(p).fd.is_some());

        let (base_fd, path) = match base {
            Some(p) => {
                let raw = match self.arena.get(p).fd {
                    Some(ref fd) => fd.as_raw(),
                    None => return,
                };
                (raw, self.arena.get(id).name.to_vec())
            }
            None => {
                let mut full = Vec::new();
                self.arena.write_path(id, &mut full);
                (libc::AT_FDCWD, full)
            }
        };

        if let Some(p) = base {
            self.arena.get_mut(p).pinned += 1;
        }
        if let Some(ref mut ioq) = self.ioq {
            ioq.submit_open_dir(Self::tag(id), base_fd, &path);
            self.open_pending.insert(Self::tag(id));
        }
    }

    /// Submits one stat per batched entry so classification overlaps the
    /// callbacks, then consumes the completions in order.
    fn prefetch_batch_stats(&mut self, reader: &Reader) {
        self.batch_stats.clear();
        if self.ioq.is_none()
            || !(self.opts.flags.stat_every || self.opts.flags.needs_identity())
        {
            return;
        }

        let flavor = self.follow_flavor();
        let at_fd = reader.at_fd();
        let count = reader.batch().len();
        self.batch_stats.resize(count, None);

        let mut submitted = 0usize;
        let mut consumed = 0usize;
        while consumed < count {
            while submitted < count
                && self
                    .ioq
                    .as_ref()
                    .is_some_and(|ioq| ioq.in_flight() < self.prefetch_window)
            {
                let name = &reader.batch()[submitted].name;
                if let Some(ref mut ioq) = self.ioq {
                    ioq.submit_stat(submitted as u64, at_fd, name, flavor);
                }
                submitted += 1;
            }
            let Some(op) = (match self.ioq {
                Some(ref mut ioq) => ioq.pop(true),
                None => None,
            }) else {
                break;
            };
            if let Some(slot) = self.integrate_async(op) {
                consumed += 1;
                let _ = slot;
            }
        }
    }

    /// Pops one completion off the ready ring and routes it.
    fn consume_one_async(&mut self, block: bool) -> bool {
        let op = match self.ioq {
            Some(ref mut ioq) => ioq.pop(block),
            None => None,
        };
        match op {
            Some(op) => {
                self.integrate_async(op);
                true
            }
            None => false,
        }
    }

    /// Routes an async completion back into engine state. Returns the batch
    /// index for stat completions so the prefetch loop can count them.
    fn integrate_async(&mut self, op: Box<IoqOp>) -> Option<usize> {
        let IoqOp { tag, request, result } = *op;
        match request {
            IoqRequest::OpenDir { .. } => {
                let node = NodeId::from_index(tag as u32);
                if let Some(parent) = self.arena.get(node).parent {
                    let p = self.arena.get_mut(parent);
                    p.pinned = p.pinned.saturating_sub(1);
                }
                let outcome = match result {
                    Some(Ok(IoqOutput::Fd(fd))) => Ok(fd),
                    Some(Err(errno)) => Err(errno),
                    _ => Err(libc::EIO),
                };
                self.open_results.insert(tag, outcome);
                None
            }
            IoqRequest::Stat { .. } => {
                let index = tag as usize;
                let outcome = match result {
                    Some(Ok(IoqOutput::Stat(stat))) => Ok(stat),
                    Some(Err(errno)) => Err(errno),
                    _ => Err(libc::EIO),
                };
                if let Some(slot) = self.batch_stats.get_mut(index) {
                    *slot = Some(outcome);
                }
                Some(index)
            }
            IoqRequest::Close { .. } | IoqRequest::CloseDir { .. } | IoqRequest::Stop => None,
        }
    }

    /// Blocks until the open tagged `tag` completes, integrating everything
    /// that arrives before it (responses are consumed in submission order).
    fn claim_open(&mut self, tag: u64) -> core::result::Result<FileDes, Errno> {
        loop {
            if let Some(outcome) = self.open_results.remove(&tag) {
                return outcome;
            }
            if !self.consume_one_async(true) {
                return Err(libc::EIO);
            }
        }
    }

    /// Tears the pass down: cancel and drain the I/O queue, then release
    /// whatever the queue still holds, silently.
    fn teardown(&mut self) {
        if let Some(ioq) = self.ioq.take() {
            ioq.cancel();
            drop(ioq);
        }
        self.open_results.clear();
        self.open_pending.clear();

        if !self.queue.is_empty() {
            // Post visits for an interrupted pass are forfeit.
            self.stopped = true;
            while let Some(id) = self.queue.pop(&mut self.arena) {
                self.release(id);
            }
        }
        self.cache.destroy(&mut self.arena);
        debug_assert!(self.arena.live() == 0 || self.stopped, "leaked nodes after a clean pass");
    }
}

/// Byte offset of the final path component (0 for `/` and bare names).
fn basename_offset(path: &[u8]) -> usize {
    if path.len() <= 1 {
        return 0;
    }
    // Ignore trailing slashes when locating the basename.
    let mut end = path.len();
    while end > 1 && path[end - 1] == b'/' {
        end -= 1;
    }
    path[..end]
        .iter()
        .rposition(|&b| b == b'/')
        .map_or(0, |pos| pos + 1)
}

#[cfg(test)]
mod tests {
    use super::basename_offset;

    #[test]
    fn basename_offsets() {
        assert_eq!(basename_offset(b"/"), 0);
        assert_eq!(basename_offset(b"a"), 0);
        assert_eq!(basename_offset(b"a/b"), 2);
        assert_eq!(basename_offset(b"/usr/share"), 5);
        assert_eq!(basename_offset(b"/usr/share/"), 5);
    }
}

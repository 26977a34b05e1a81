mod engine;
mod reader;
mod types;
mod visit;

pub use types::{Strategy, VisitAction, VisitKind, WalkFlags};
pub use visit::{StatCache, Visit};

use crate::error::Result;
use std::ffi::{OsStr, OsString};

/**
 The full configuration of one traversal.

 Usually produced through [`WalkBuilder`]; the struct is public so callers
 that already hold a configuration (an expression evaluator, a test harness)
 can construct it directly.
*/
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Root paths, walked in order. Empty is an error.
    pub paths: Vec<OsString>,
    /// Descriptor budget; the cache keeps at most `max_open_fd - 1`
    /// directories open (one slot is reserved for the reader's dup)
    pub max_open_fd: usize,
    /// Worker threads for the asynchronous I/O queue; 0 disables it
    pub n_threads: usize,
    pub flags: WalkFlags,
    pub strategy: Strategy,
    /// Device ids of known mount points, consumed only by the mount flags
    pub mount_table: Option<Vec<u64>>,
    /// Entries shallower than this are traversed but not reported
    pub min_depth: u32,
    /// Entries at this depth are reported but not descended into
    pub max_depth: Option<u32>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            max_open_fd: default_fd_budget(),
            n_threads: 0,
            flags: WalkFlags::default(),
            strategy: Strategy::default(),
            mount_table: None,
            min_depth: 0,
            max_depth: None,
        }
    }
}

/// Soft `RLIMIT_NOFILE` minus headroom for the caller's own descriptors,
/// clamped to something sane when the limit is unknowable.
fn default_fd_budget() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: plain pointer-out syscall on a stack struct
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &raw mut limit) };
    if rc != 0 {
        return 256;
    }
    #[allow(clippy::cast_possible_truncation)]
    let soft = limit.rlim_cur as usize;
    soft.saturating_sub(16).clamp(16, 4096)
}

/**
 Runs a traversal, invoking `callback` for every visit.

 Returns `Ok(())` on clean completion, including a callback-initiated
 [`VisitAction::Stop`]. A fatal engine failure returns the error with the
 first responsible errno preserved; per-entry failures only become fatal
 when [`WalkFlags::recover`] is off.

 # Examples
 ```no_run
 use ftw::{VisitAction, WalkBuilder};

 let mut count = 0usize;
 WalkBuilder::new("/var/tmp")
     .post_order(true)
     .run(|visit| {
         count += 1;
         let _ = visit.path();
         VisitAction::Continue
     })
     .expect("traversal failed");
 println!("{count} visits");
 ```
*/
pub fn walk<F>(options: &WalkOptions, mut callback: F) -> Result<()>
where
    F: FnMut(&Visit<'_>) -> VisitAction,
{
    engine::walk_with(options, &mut callback)
}

/// Fluent constructor for [`WalkOptions`].
#[derive(Debug, Clone, Default)]
pub struct WalkBuilder {
    options: WalkOptions,
}

impl WalkBuilder {
    /// Starts a builder rooted at `path`.
    #[must_use]
    #[inline]
    pub fn new<P: AsRef<OsStr>>(path: P) -> Self {
        let mut options = WalkOptions::default();
        options.paths.push(path.as_ref().to_os_string());
        Self { options }
    }

    /// Adds another root, walked after the previous ones.
    #[must_use]
    #[inline]
    pub fn add_root<P: AsRef<OsStr>>(mut self, path: P) -> Self {
        self.options.paths.push(path.as_ref().to_os_string());
        self
    }

    /// Sets the descriptor budget (minimum 2).
    #[must_use]
    #[inline]
    pub fn max_open_fd(mut self, budget: usize) -> Self {
        self.options.max_open_fd = budget;
        self
    }

    /// Enables the asynchronous I/O queue with `n` worker threads.
    #[must_use]
    #[inline]
    pub fn threads(mut self, n: usize) -> Self {
        self.options.n_threads = n;
        self
    }

    /// Selects the traversal strategy.
    #[must_use]
    #[inline]
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.options.strategy = strategy;
        self
    }

    /// Supplies the mount-point device list for the mount-aware flags.
    #[must_use]
    #[inline]
    pub fn mount_table(mut self, devices: Vec<u64>) -> Self {
        self.options.mount_table = Some(devices);
        self
    }

    /// Suppresses visits shallower than `depth`.
    #[must_use]
    #[inline]
    pub fn min_depth(mut self, depth: u32) -> Self {
        self.options.min_depth = depth;
        self
    }

    /// Reports but does not descend below `depth`.
    #[must_use]
    #[inline]
    pub fn max_depth(mut self, depth: Option<u32>) -> Self {
        self.options.max_depth = depth;
        self
    }

    /// Stat every entry even when `d_type` already answers.
    #[must_use]
    #[inline]
    pub fn stat_every(mut self, on: bool) -> Self {
        self.options.flags.stat_every = on;
        self
    }

    /// Deliver per-entry errors as visits instead of aborting.
    #[must_use]
    #[inline]
    pub fn recover(mut self, on: bool) -> Self {
        self.options.flags.recover = on;
        self
    }

    /// Emit directory post-visits.
    #[must_use]
    #[inline]
    pub fn post_order(mut self, on: bool) -> Self {
        self.options.flags.post_order = on;
        self
    }

    /// Dereference symlinked roots.
    #[must_use]
    #[inline]
    pub fn follow_roots(mut self, on: bool) -> Self {
        self.options.flags.follow_roots = on;
        self
    }

    /// Follow every symlink (implies cycle detection).
    #[must_use]
    #[inline]
    pub fn follow_all(mut self, on: bool) -> Self {
        self.options.flags.follow_all = on;
        self
    }

    /// Detect directory cycles without following symlinks generally.
    #[must_use]
    #[inline]
    pub fn detect_cycles(mut self, on: bool) -> Self {
        self.options.flags.detect_cycles = on;
        self
    }

    /// Neither visit nor descend into mount points.
    #[must_use]
    #[inline]
    pub fn skip_mounts(mut self, on: bool) -> Self {
        self.options.flags.skip_mounts = on;
        self
    }

    /// Visit mount points but do not descend into them.
    #[must_use]
    #[inline]
    pub fn prune_mounts(mut self, on: bool) -> Self {
        self.options.flags.prune_mounts = on;
        self
    }

    /// Byte-lexicographic entry order within each directory.
    #[must_use]
    #[inline]
    pub fn sort(mut self, on: bool) -> Self {
        self.options.flags.sort = on;
        self
    }

    /// Read each directory completely before invoking any callback on it.
    #[must_use]
    #[inline]
    pub fn buffer(mut self, on: bool) -> Self {
        self.options.flags.buffer = on;
        self
    }

    /// Surface BSD whiteout entries.
    #[must_use]
    #[inline]
    pub fn whiteouts(mut self, on: bool) -> Self {
        self.options.flags.whiteouts = on;
        self
    }

    /// Finishes the builder.
    #[must_use]
    #[inline]
    pub fn build(self) -> WalkOptions {
        self.options
    }

    /// Builds and runs in one step.
    #[inline]
    pub fn run<F>(self, callback: F) -> Result<()>
    where
        F: FnMut(&Visit<'_>) -> VisitAction,
    {
        walk(&self.options, callback)
    }
}

/// What the callback tells the engine to do after a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum VisitAction {
    /// Keep going; directories are queued for descent
    Continue,
    /// Do not descend into this directory, keep iterating its siblings
    PruneSubtree,
    /// Abandon the rest of this directory's entries immediately
    PruneSiblings,
    /// Terminate the whole traversal; the walk still returns success
    Stop,
}

/// Whether a visit happens before or after a directory's children.
/// Non-directories only ever produce pre visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum VisitKind {
    Pre,
    Post,
}

/// Queue discipline and deepening behaviour for a traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::exhaustive_enums)]
pub enum Strategy {
    /// Level order: all depth-k paths precede any depth-(k+1) path
    #[default]
    Bfs,
    /// Depth first: a directory's descendants are contiguous
    Dfs,
    /// Depth-first passes with limits 1, 2, 3, ...
    IterativeDeepening,
    /// Depth-first passes with limits 1, 2, 4, 8, ...
    ExponentialDeepening,
}

impl Strategy {
    /// Whether this strategy re-enters the engine with growing depth limits.
    #[must_use]
    #[inline]
    pub const fn is_deepening(self) -> bool {
        matches!(self, Self::IterativeDeepening | Self::ExponentialDeepening)
    }
}

/**
 The boolean switches of a traversal.

 These mirror the classic `find`-family semantics: `recover` turns per-entry
 errors into error visits instead of aborting, `follow_all` implies cycle
 detection, and the mount pair differ in whether the mount point itself is
 reported (`prune_mounts`) or suppressed entirely (`skip_mounts`).
*/
#[derive(Debug, Clone, Copy, Default)]
#[allow(clippy::struct_excessive_bools)] //flat switches are the clearest shape here
pub struct WalkFlags {
    /// Stat every entry even when `d_type` is definitive
    pub stat_every: bool,
    /// Deliver per-entry errors as visits rather than aborting
    pub recover: bool,
    /// Emit directory post-visits
    pub post_order: bool,
    /// Dereference symlinked root paths
    pub follow_roots: bool,
    /// Follow every symlink; implies cycle detection
    pub follow_all: bool,
    /// Cycle detection without general symlink following
    pub detect_cycles: bool,
    /// Do not descend into nor visit mount points
    pub skip_mounts: bool,
    /// Visit mount points but do not descend into them
    pub prune_mounts: bool,
    /// Byte-lexicographic entry order within each directory
    pub sort: bool,
    /// Read a directory completely before invoking any callback on it
    pub buffer: bool,
    /// Surface BSD whiteout entries instead of dropping them
    pub whiteouts: bool,
}

impl WalkFlags {
    /// Whether any flag requires `(device, inode)` identity for pushed
    /// directories.
    #[must_use]
    #[inline]
    pub(crate) const fn needs_identity(&self) -> bool {
        self.detect_cycles || self.follow_all || self.skip_mounts || self.prune_mounts
    }

    /// Whether cycle detection is active (directly or via `follow_all`).
    #[must_use]
    #[inline]
    pub(crate) const fn cycles_checked(&self) -> bool {
        self.detect_cycles || self.follow_all
    }

    /// Whether the reader drains a directory before any callback runs.
    #[must_use]
    #[inline]
    pub(crate) const fn batched(&self) -> bool {
        self.sort || self.buffer
    }
}

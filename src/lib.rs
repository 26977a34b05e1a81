/*!
 A bounded-descriptor POSIX file-tree walker.

 This library is the traversal core of a `find`-style tool: given one or
 more root paths it walks the hierarchy breadth- or depth-first, invoking a
 callback on every file with rich per-file metadata. The things it is
 careful about:

 - A strictly bounded number of open file descriptors, without re-walking
   paths: a priority-heap cache keeps the hottest directory handles open and
   reopens the rest by composing `openat` from the nearest open ancestor.
 - Hierarchies whose full paths exceed `PATH_MAX` (`ENAMETOOLONG` is
   recovered by opening component by component).
 - Directory cycles under symlink following, detected by `(device, inode)`
   ancestor comparison and reported as `ELOOP` visits.
 - Per-entry I/O errors, delivered as error visits under the opt-in
   recovery mode instead of aborting the walk.
 - Overlapping syscall latency with consumer work through an optional
   worker pool fed by a wait-free MPMC command ring.

 # Examples
 Collect every path under a directory in breadth-first order
 ```no_run
 use ftw::{Strategy, VisitAction, WalkBuilder};

 let mut paths: Vec<Vec<u8>> = Vec::new();
 WalkBuilder::new("/etc")
     .strategy(Strategy::Bfs)
     .recover(true)
     .run(|visit| {
         paths.push(visit.path().to_vec());
         VisitAction::Continue
     })
     .expect("walk failed");
 ```

 Bounded descriptors and symlink following with cycle detection
 ```no_run
 use ftw::{FileType, VisitAction, WalkBuilder};

 WalkBuilder::new("/srv")
     .max_open_fd(16)
     .follow_all(true)
     .recover(true)
     .run(|visit| {
         if visit.file_type() == FileType::Error {
             eprintln!("error {:?} at {:?}", visit.error(), visit.path());
         }
         VisitAction::Continue
     })
     .expect("walk failed");
 ```
*/

#[macro_use]
mod macros;

mod error;
pub mod fs;
pub mod ioq;
mod tree;
pub mod walk;

pub use error::{Result, TraversalError};
pub use fs::{FileDes, FileStat, FileType};
pub use ioq::Ioq;
pub use walk::{
    StatCache, Strategy, Visit, VisitAction, VisitKind, WalkBuilder, WalkFlags, WalkOptions, walk,
};

// More efficient than the system allocator for the small, short-lived
// allocations a traversal makes (names, nodes, ring ops).
#[cfg(all(
    feature = "mimalloc",
    any(target_os = "linux", target_os = "macos", target_os = "android")
))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[cfg(test)]
mod test;

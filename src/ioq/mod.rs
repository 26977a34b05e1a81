/*!
 The asynchronous I/O queue.

 Directory opens, closes and stats are submitted to a small pool of worker
 threads so syscall latency overlaps the main thread's own work (callback
 evaluation, path construction). Two rings connect the sides: `pending`
 carries requests main → workers, `ready` carries completions back. Workers
 touch nothing but the rings, the syscalls and their own response structs;
 the cache heap, node graph and queue stay main-thread property.

 The queue is an optimisation, not a correctness dependency: a traversal
 built with zero threads runs every syscall inline.
*/

mod ops;
mod ring;
#[cfg(all(target_os = "linux", feature = "io_uring"))]
mod uring;

pub use ops::{IoqOp, IoqOutput, IoqRequest};
pub(crate) use ring::RING_SLOTS;
use ring::IoqRing;

use crate::fs::{DirStream, FileDes};
use core::sync::atomic::{AtomicBool, Ordering};
use std::ffi::CString;
use std::sync::Arc;
use std::thread::JoinHandle;

const_from_env!(
    /// Worker threads used when a caller asks for "default" parallelism,
    /// exported by `build.rs` from `available_parallelism`.
    DEFAULT_THREADS: usize = "FTW_DEFAULT_THREADS", 4
);

/**
 Handle to a running worker pool.

 Submission and consumption are single-caller by design (the traversal
 engine is single-threaded); the rings themselves are MPMC so the workers
 can share both ends freely.

 In-flight accounting lives here rather than in the ring: the caller must
 keep `in_flight() < capacity()` to stay deadlock-free, since a full ready
 ring blocks the workers and a full pending ring blocks the submitter.
*/
pub struct Ioq {
    pending: Arc<IoqRing>,
    ready: Arc<IoqRing>,
    cancel: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    in_flight: usize,
}

impl Ioq {
    /// Spawns `n_threads` workers (0 is promoted to the build-time default).
    #[must_use]
    pub fn start(n_threads: usize) -> Self {
        let n_threads = if n_threads == 0 { DEFAULT_THREADS } else { n_threads };
        let pending = Arc::new(IoqRing::new());
        let ready = Arc::new(IoqRing::new());
        let cancel = Arc::new(AtomicBool::new(false));

        let workers = (0..n_threads)
            .map(|_| {
                let pending = Arc::clone(&pending);
                let ready = Arc::clone(&ready);
                let cancel = Arc::clone(&cancel);
                std::thread::spawn(move || worker_main(&pending, &ready, &cancel))
            })
            .collect();

        Self {
            pending,
            ready,
            cancel,
            workers,
            in_flight: 0,
        }
    }

    /// Requests the pool can hold before submission blocks.
    #[must_use]
    #[inline]
    pub const fn capacity(&self) -> usize {
        RING_SLOTS
    }

    /// Submitted requests whose responses have not been consumed yet.
    #[must_use]
    #[inline]
    pub const fn in_flight(&self) -> usize {
        self.in_flight
    }

    #[inline]
    fn submit(&mut self, op: Box<IoqOp>) {
        self.in_flight += 1;
        self.pending.push(op);
    }

    /// Submits an `openat` of the directory `path` under `parent_fd`. The
    /// caller keeps `parent_fd` open until the response comes back.
    pub fn submit_open_dir(&mut self, tag: u64, parent_fd: i32, path: &[u8]) {
        // SAFETY: kernel-provided names and caller paths contain no interior NUL
        let path = unsafe { CString::from_vec_unchecked(path.to_vec()) };
        self.submit(Box::new(IoqOp::new(tag, IoqRequest::OpenDir { parent_fd, path })));
    }

    /// Submits a stat of `path` under `parent_fd`.
    pub fn submit_stat(&mut self, tag: u64, parent_fd: i32, path: &[u8], follow: bool) {
        // SAFETY: as above
        let path = unsafe { CString::from_vec_unchecked(path.to_vec()) };
        self.submit(Box::new(IoqOp::new(
            tag,
            IoqRequest::Stat {
                parent_fd,
                path,
                follow,
            },
        )));
    }

    /// Hands a bare descriptor to the pool for closing.
    pub fn submit_close(&mut self, tag: u64, fd: FileDes) {
        self.submit(Box::new(IoqOp::new(tag, IoqRequest::Close { fd: Some(fd) })));
    }

    /// Hands a finished directory stream to the pool for closing.
    pub fn submit_close_dir(&mut self, tag: u64, stream: DirStream) {
        self.submit(Box::new(IoqOp::new(
            tag,
            IoqRequest::CloseDir {
                stream: Some(stream),
            },
        )));
    }

    /// Consumes the next completion in submission order. Non-blocking calls
    /// return `None` when nothing is ready yet.
    pub fn pop(&mut self, block: bool) -> Option<Box<IoqOp>> {
        debug_assert!(self.in_flight > 0 || !block, "blocking pop with nothing in flight");
        let op = self.ready.pop(block)?;
        self.in_flight -= 1;
        Some(op)
    }

    /// Flags cancellation: queued open/stat requests short-circuit with
    /// `EINTR` from here on; close requests still execute.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }
}

impl Drop for Ioq {
    fn drop(&mut self) {
        // One stop sentinel per worker. Sentinels queue behind every
        // outstanding request, so the pool drains before it parks.
        for _ in 0..self.workers.len() {
            self.pending.push(Box::new(IoqOp::new(0, IoqRequest::Stop)));
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        // Every submitted request now has its response parked in the ready
        // ring; consume them so descriptors inside get closed.
        while self.in_flight > 0 {
            let _ = self.pop(true);
        }
    }
}

/// Synchronous worker body: pop, execute, complete, until a stop sentinel.
fn worker_main(pending: &IoqRing, ready: &IoqRing, cancel: &AtomicBool) {
    #[cfg(all(target_os = "linux", feature = "io_uring"))]
    {
        // Batched submission when the kernel cooperates; otherwise fall
        // through to the portable loop.
        if uring::worker_main_uring(pending, ready, cancel) {
            return;
        }
    }

    loop {
        let Some(mut op) = pending.pop(true) else {
            continue;
        };
        if matches!(op.request, IoqRequest::Stop) {
            return;
        }
        op.execute(cancel.load(Ordering::Acquire));
        ready.push(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_echo_tags_in_submission_order() {
        let mut ioq = Ioq::start(2);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().as_os_str().as_encoded_bytes();

        for tag in 0..8 {
            ioq.submit_open_dir(tag, libc::AT_FDCWD, path);
        }
        for tag in 0..8 {
            let op = ioq.pop(true).unwrap();
            assert_eq!(op.tag, tag);
            assert!(matches!(op.result, Some(Ok(IoqOutput::Fd(_)))));
        }
        assert_eq!(ioq.in_flight(), 0);
    }

    #[test]
    fn cancelled_opens_short_circuit_with_eintr() {
        let mut ioq = Ioq::start(1);
        ioq.cancel();
        ioq.submit_open_dir(1, libc::AT_FDCWD, b".");
        let op = ioq.pop(true).unwrap();
        assert_eq!(op.result.and_then(|r| r.err()), Some(libc::EINTR));
    }

    #[test]
    fn drop_reaps_unconsumed_responses() {
        let mut ioq = Ioq::start(2);
        for tag in 0..4 {
            ioq.submit_open_dir(tag, libc::AT_FDCWD, b".");
        }
        // Dropping with responses outstanding must close their descriptors.
        drop(ioq);
    }
}

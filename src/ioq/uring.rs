//! Batched `io_uring` submission for the worker pool.
//!
//! Each worker owns one ring. Requests are popped in bunches, translated to
//! SQEs, submitted together, and their completions written back into the
//! same op structs before the whole bunch is pushed to the ready ring in
//! submission order. Setup failure (old kernel, seccomp) falls back to the
//! portable syscall loop.

use crate::fs::fd::OPEN_DIR_FLAGS;
use crate::fs::{FileDes, FileStat};
use crate::ioq::ops::{IoqOp, IoqOutput, IoqRequest};
use crate::ioq::ring::IoqRing;
use core::sync::atomic::{AtomicBool, Ordering};
use io_uring::{IoUring, opcode, types};

/// Requests batched per submission round.
const BATCH: usize = 16;

/// Runs the worker loop through a uring. Returns `false` when the ring
/// cannot be set up, letting the caller fall back to direct syscalls.
pub(super) fn worker_main_uring(pending: &IoqRing, ready: &IoqRing, cancel: &AtomicBool) -> bool {
    #[allow(clippy::cast_possible_truncation)]
    let Ok(mut uring) = IoUring::new((BATCH * 2) as u32) else {
        return false;
    };

    // SAFETY: statx is a plain-old-data record the kernel fills
    let zeroed: libc::statx = unsafe { core::mem::zeroed() };
    let mut statx_bufs: Vec<libc::statx> = vec![zeroed; BATCH];

    loop {
        let mut batch: Vec<Box<IoqOp>> = Vec::with_capacity(BATCH);
        let mut saw_stop = false;

        match pending.pop(true) {
            Some(op) if matches!(op.request, IoqRequest::Stop) => return true,
            Some(op) => batch.push(op),
            None => continue,
        }
        while batch.len() < BATCH {
            match pending.pop(false) {
                Some(op) if matches!(op.request, IoqRequest::Stop) => {
                    saw_stop = true;
                    break;
                }
                Some(op) => batch.push(op),
                None => break,
            }
        }

        run_batch(&mut uring, &mut batch, &mut statx_bufs, cancel.load(Ordering::Acquire));

        for op in batch {
            ready.push(op);
        }
        if saw_stop {
            return true;
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn run_batch(
    uring: &mut IoUring,
    batch: &mut [Box<IoqOp>],
    statx_bufs: &mut [libc::statx],
    cancelled: bool,
) {
    let mut sqes = Vec::with_capacity(batch.len());
    // Descriptors already handed over to Close SQEs, reclaimed on failure.
    let mut close_fds: Vec<(usize, i32)> = Vec::new();

    for (i, op) in batch.iter_mut().enumerate() {
        let user_data = i as u64;
        match op.request {
            IoqRequest::OpenDir {
                parent_fd,
                ref path,
            } => {
                if cancelled {
                    op.result = Some(Err(libc::EINTR));
                } else {
                    sqes.push(
                        opcode::OpenAt::new(types::Fd(parent_fd), path.as_ptr())
                            .flags(OPEN_DIR_FLAGS)
                            .build()
                            .user_data(user_data),
                    );
                }
            }
            IoqRequest::Stat {
                parent_fd,
                ref path,
                follow,
            } => {
                if cancelled {
                    op.result = Some(Err(libc::EINTR));
                } else {
                    let flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
                    sqes.push(
                        opcode::Statx::new(
                            types::Fd(parent_fd),
                            path.as_ptr(),
                            (&raw mut statx_bufs[i]).cast(),
                        )
                        .flags(flags)
                        .mask(libc::STATX_BASIC_STATS)
                        .build()
                        .user_data(user_data),
                    );
                }
            }
            // Closes run even under cancellation.
            IoqRequest::Close { ref mut fd } => {
                if let Some(fd) = fd.take() {
                    let raw = fd.into_raw();
                    close_fds.push((i, raw));
                    sqes.push(opcode::Close::new(types::Fd(raw)).build().user_data(user_data));
                } else {
                    op.result = Some(Ok(IoqOutput::Unit));
                }
            }
            // A stream close also frees its batch buffer, so it stays a
            // plain drop on the worker rather than an SQE.
            IoqRequest::CloseDir { .. } | IoqRequest::Stop => op.execute(cancelled),
        }
    }

    if sqes.is_empty() {
        return;
    }

    let mut pushed = 0usize;
    {
        let mut sq = uring.submission();
        for sqe in &sqes {
            // SAFETY: every pointer in the entry (paths, statx buffers) lives
            // in `batch`/`statx_bufs`, which outlive the completion wait below
            if unsafe { sq.push(sqe) }.is_err() {
                break;
            }
            pushed += 1;
        }
    }

    if uring.submit_and_wait(pushed).is_err() {
        // Degenerate path: reclaim the close descriptors and fail the rest.
        for &(i, raw) in &close_fds {
            // SAFETY: the kernel never consumed the SQE, we still own raw
            unsafe { libc::close(raw) };
            batch[i].result = Some(Ok(IoqOutput::Unit));
        }
        for op in batch.iter_mut() {
            if op.result.is_none() {
                op.result = Some(Err(libc::EIO));
            }
        }
        return;
    }

    for cqe in uring.completion() {
        let i = cqe.user_data() as usize;
        let res = cqe.result();
        let op = &mut batch[i];
        op.result = Some(match op.request {
            IoqRequest::OpenDir { .. } => {
                if res >= 0 {
                    Ok(IoqOutput::Fd(FileDes::from_raw(res)))
                } else {
                    Err(-res)
                }
            }
            IoqRequest::Stat { .. } => {
                if res == 0 {
                    Ok(IoqOutput::Stat(FileStat::from(&statx_bufs[i])))
                } else {
                    Err(-res)
                }
            }
            _ => Ok(IoqOutput::Unit),
        });
    }

    // Anything the submission queue could not take runs synchronously.
    for op in batch.iter_mut() {
        if op.result.is_none() {
            op.execute(cancelled);
        }
    }
}

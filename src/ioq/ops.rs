use crate::fs::{DirStream, Errno, FileDes, FileStat, fstatat};
use std::ffi::CString;

/// One command submitted to the worker pool.
#[derive(Debug)]
pub enum IoqRequest {
    /// `openat` the directory `path` relative to `parent_fd`. The submitter
    /// guarantees `parent_fd` stays open until the response is consumed.
    OpenDir { parent_fd: i32, path: CString },
    /// Close a bare descriptor. Runs even under cancellation, matching the
    /// POSIX rule that `EINTR` never leaves a descriptor half-closed.
    Close { fd: Option<FileDes> },
    /// Tear down a directory stream (closes its dup'd descriptor).
    CloseDir { stream: Option<DirStream> },
    /// Stat `path` relative to `parent_fd`.
    Stat {
        parent_fd: i32,
        path: CString,
        follow: bool,
    },
    /// Worker shutdown sentinel; one per worker is pushed at teardown.
    Stop,
}

/// Successful payload of a completed op.
#[derive(Debug)]
pub enum IoqOutput {
    /// The opened directory descriptor
    Fd(FileDes),
    /// The stat record
    Stat(FileStat),
    /// Close-type ops complete with no payload
    Unit,
}

/**
 One in-flight operation, allocated once and reused as its own response.

 The `tag` is caller-owned identity: the main thread pairs responses back to
 their submissions with it, since sibling completions can finish out of
 submission order on the workers even though the ready ring delivers them in
 submission order.
*/
#[derive(Debug)]
pub struct IoqOp {
    /// Caller-attached identity, echoed back untouched
    pub tag: u64,
    pub request: IoqRequest,
    /// Filled by the worker before the op is pushed to the ready ring
    pub result: Option<Result<IoqOutput, Errno>>,
}

impl IoqOp {
    #[must_use]
    #[inline]
    pub const fn new(tag: u64, request: IoqRequest) -> Self {
        Self {
            tag,
            request,
            result: None,
        }
    }

    /// Executes the request synchronously, honouring the cancellation rule:
    /// open/stat short-circuit with `EINTR`, closes always run.
    pub(crate) fn execute(&mut self, cancelled: bool) {
        self.result = Some(match self.request {
            IoqRequest::OpenDir {
                parent_fd,
                ref path,
            } => {
                if cancelled {
                    Err(libc::EINTR)
                } else {
                    FileDes::open_dir_at(parent_fd, path.as_ptr()).map(IoqOutput::Fd)
                }
            }
            IoqRequest::Stat {
                parent_fd,
                ref path,
                follow,
            } => {
                if cancelled {
                    Err(libc::EINTR)
                } else {
                    fstatat(parent_fd, path.as_ptr(), follow).map(IoqOutput::Stat)
                }
            }
            IoqRequest::Close { ref mut fd } => {
                drop(fd.take());
                Ok(IoqOutput::Unit)
            }
            IoqRequest::CloseDir { ref mut stream } => {
                drop(stream.take());
                Ok(IoqOutput::Unit)
            }
            IoqRequest::Stop => Ok(IoqOutput::Unit),
        });
    }
}

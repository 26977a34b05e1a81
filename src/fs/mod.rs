mod buffer;
mod dirent;
pub(crate) mod fd;
mod stat;

pub use buffer::AlignedBuffer;
pub use dirent::{DirStream, RawEntry};
pub use fd::{CPathBuf, FileDes};
pub(crate) use stat::DT_WHT_RAW;
pub use stat::{FileStat, FileType, fstatat};

/// Raw OS error code. The fs layer reports failures as bare errnos so the
/// walk layer can memoize, compare and forward them without unwrapping an
/// error struct each time.
pub type Errno = i32;

#![allow(clippy::undocumented_unsafe_blocks)]

fn main() {
    // Default worker count for the asynchronous I/O queue when the caller
    // does not pick one explicitly.
    const MIN_THREADS: usize = 1;
    let num_threads =
        std::thread::available_parallelism().map_or(MIN_THREADS, core::num::NonZeroUsize::get);

    println!("cargo:rustc-env=FTW_DEFAULT_THREADS={num_threads}");

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    println!("cargo:rustc-env=FTW_PAGE_SIZE={page_size}");
}

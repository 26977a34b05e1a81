#![allow(unused_macros)]

/// Compile-time assertion, similar to a `static_assert` from c++.
macro_rules! const_assert {
    ($cond:expr, $msg:expr) => {
        const _: () = assert!($cond, $msg);
    };
    ($cond:expr) => {
        const _: () = assert!($cond);
    };
}

/**
 A helper macro to safely access the fields of a `libc::dirent64` by offset.

 The trailing `d_name` field is declared as `[c_char; 256]` but that size is
 meaningless; only the offset of `d_name` is meaningful, and the allocation
 behind the pointer may be smaller or larger than the struct implies. Going
 through `&raw const` keeps each access equivalent to a `byte_offset`, so the
 full extent of `*entry_ptr` never needs to be in bounds.

 # Safety
 - The caller must ensure that the pointer is valid and points to a `dirent64`.

 # Usage
 ```ignore
 let d_name_ptr: *const u8 = access_dirent!(entry_ptr, d_name);
 let d_reclen: usize = access_dirent!(entry_ptr, d_reclen);
 let d_ino: u64 = access_dirent!(entry_ptr, d_ino);
 let d_type: u8 = access_dirent!(entry_ptr, d_type);
 ```
*/
macro_rules! access_dirent {
    ($entry_ptr:expr, d_reclen) => {{
        // SAFETY: Caller must ensure pointer is valid
        (*$entry_ptr).d_reclen as usize
    }};
    ($entry_ptr:expr, d_name) => {{
        (&raw const (*$entry_ptr).d_name).cast::<u8>()
    }};
    ($entry_ptr:expr, d_type) => {{
        // SAFETY: Caller must ensure pointer is valid
        (*$entry_ptr).d_type
    }};
    ($entry_ptr:expr, d_ino) => {{
        // SAFETY: Caller must ensure pointer is valid
        (*$entry_ptr).d_ino
    }};
}

#[doc(hidden)]
/// A macro to skip `.` and `..` entries when streaming a directory.
///
/// Takes:
/// - `$entry`: pointer to a `dirent64`
/// - `$action`: a control-flow statement (e.g., `continue`, `break`)
///
/// Only `DT_DIR` and `DT_UNKNOWN` entries can be dot entries, so other types
/// bypass the name inspection entirely.
macro_rules! skip_dot_or_dot_dot_entries {
    ($entry:expr, $action:expr) => {{
        #[allow(unused_unsafe)]
        #[allow(clippy::multiple_unsafe_ops_per_block)]
        // SAFETY: when calling this macro, the pointer has already been ensured to be non null
        unsafe {
            match access_dirent!($entry, d_type) {
                libc::DT_DIR | libc::DT_UNKNOWN => {
                    let name_ptr = access_dirent!($entry, d_name);
                    match (*name_ptr.add(0), *name_ptr.add(1), *name_ptr.add(2)) {
                        (b'.', 0, _) | (b'.', b'.', 0) => $action,
                        _ => (),
                    }
                }
                _ => (),
            }
        }
    }};
}

/// Macro to create a const from an env var with compile-time parsing.
///
/// # Usage
/// ```
/// use ftw::const_from_env;
///
/// const_from_env!(MY_RING_SLOTS: usize = "MY_RING_SLOTS", 64);
/// assert_eq!(MY_RING_SLOTS, 64); // default when the env var is unset
/// ```
///
/// # Notes
/// - The value is parsed at compile time
/// - The environment variable must contain only digits
#[macro_export]
macro_rules! const_from_env {
    ($(#[$meta:meta])* $name:ident: $t:ty = $env:expr, $default:expr) => {
        $(#[$meta])*
        pub const $name: $t = {
            // A helper const function to parse a string into a number.
            // This is used only when an environment variable is found.
            #[allow(clippy::single_call_fn)]
            #[allow(clippy::indexing_slicing)] //this will panic at compile time, intentionally.
            const fn parse_env(s: &str) -> $t {
                let mut n: $t = 0;
                let s_bytes = s.as_bytes();
                let mut i = 0;

                while i < s_bytes.len() {
                    let b = s_bytes[i];
                    match b {
                        b'0'..=b'9' => {
                            n = n * 10 + (b - b'0') as $t;
                        }
                        _ => panic!(concat!("Invalid numeric value in environment variable: ", stringify!($env))),
                    }
                    i += 1;
                }
                n
            }

            match option_env!($env) {
                Some(val) => parse_env(val),
                None => $default as _,
            }
        };
    };
}

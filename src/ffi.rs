//! The C ABI. Every function here collapses `crate::dispatch`'s
//! `Result`s to the POSIX/glibc convention callers expect: `NULL` plus
//! `errno` for a recoverable failure, never a panic across the FFI
//! boundary. Safety-critical violations (double free, corrupted
//! canary, ...) never reach here as `Result`s at all — they go through
//! `crate::error::fatal` and abort before `dispatch` returns.
use std::ffi::c_void;
use std::os::raw::c_int;
use std::ptr::NonNull;

use crate::dispatch;
use crate::error::Error;

fn set_errno(e: Error) {
    let code = match e {
        Error::OutOfMemory => libc::ENOMEM,
        Error::InvalidAlignment => libc::EINVAL,
        Error::SizeOverflow => libc::ENOMEM,
        Error::Provider(errno) => errno,
    };
    unsafe {
        *libc::__errno_location() = code;
    }
}

/// # Safety
/// Standard `malloc` contract: the returned pointer, if non-null, is
/// valid for `n` bytes until passed to `free`/`realloc`.
#[no_mangle]
pub unsafe extern "C" fn malloc(n: usize) -> *mut c_void {
    match dispatch::malloc(n) {
        Ok(p) => p.as_ptr() as *mut c_void,
        Err(e) => {
            set_errno(e);
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// Standard `calloc` contract.
#[no_mangle]
pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    match dispatch::calloc(count, size) {
        Ok(p) => p.as_ptr() as *mut c_void,
        Err(e) => {
            set_errno(e);
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `p` must be `NULL` or a pointer previously returned by this
/// crate's allocation functions and not yet freed.
#[no_mangle]
pub unsafe extern "C" fn realloc(p: *mut c_void, new_size: usize) -> *mut c_void {
    let p = NonNull::new(p as *mut u8);
    match dispatch::realloc(p, new_size) {
        Ok(p) => p.as_ptr() as *mut c_void,
        Err(e) => {
            set_errno(e);
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `p` must be `NULL` or a pointer previously returned by this
/// crate's allocation functions and not yet freed.
#[no_mangle]
pub unsafe extern "C" fn free(p: *mut c_void) {
    if let Some(p) = NonNull::new(p as *mut u8) {
        dispatch::free(p, None);
    }
}

/// glibc/jemalloc-style sized free: `size` must equal the size
/// originally requested (not the class-rounded usable size), or the
/// call is treated as corruption.
///
/// # Safety
/// Same as [`free`], plus the size precondition above.
#[no_mangle]
pub unsafe extern "C" fn free_sized(p: *mut c_void, size: usize) {
    if let Some(p) = NonNull::new(p as *mut u8) {
        dispatch::free(p, Some(size));
    }
}

/// # Safety
/// Classic `cfree` alias, kept for binaries linked against very old
/// libcs.
#[no_mangle]
pub unsafe extern "C" fn cfree(p: *mut c_void) {
    free(p)
}

/// # Safety
/// `memptr` must be a valid, writable `*mut *mut c_void`.
#[no_mangle]
pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut c_void, align: usize, size: usize) -> c_int {
    if align % std::mem::size_of::<*const c_void>() != 0 || !align.is_power_of_two() {
        return libc::EINVAL;
    }

    match dispatch::aligned_alloc(size, align) {
        Ok(p) => {
            *memptr = p.as_ptr() as *mut c_void;
            0
        }
        Err(Error::InvalidAlignment) => libc::EINVAL,
        Err(_) => libc::ENOMEM,
    }
}

/// # Safety
/// `align` must be a power of two.
#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
    match dispatch::aligned_alloc(size, align) {
        Ok(p) => p.as_ptr() as *mut c_void,
        Err(e) => {
            set_errno(e);
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// Legacy alias for [`aligned_alloc`] with swapped semantics around
/// non-power-of-two `align`; callers that still use it expect plain
/// `aligned_alloc` behavior.
#[no_mangle]
pub unsafe extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
    aligned_alloc(align, size)
}

/// # Safety
/// No preconditions beyond the standard `malloc`-family contract.
#[no_mangle]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    let page_size = crate::provider::default_provider().page_size();
    aligned_alloc(page_size, size)
}

/// # Safety
/// No preconditions beyond the standard `malloc`-family contract.
#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    let page_size = crate::provider::default_provider().page_size();
    let rounded = (size + page_size - 1) & !(page_size - 1);
    aligned_alloc(page_size, rounded)
}

/// # Safety
/// `p` must be `NULL` or a live pointer from this crate.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(p: *mut c_void) -> usize {
    match NonNull::new(p as *mut u8) {
        Some(p) => dispatch::usable_size(p),
        None => 0,
    }
}

/// # Safety
/// `p` must be `NULL` or a live pointer from this crate.
#[no_mangle]
pub unsafe extern "C" fn malloc_object_size(p: *mut c_void) -> usize {
    malloc_usable_size(p)
}

/// A fast, possibly-conservative variant used by fortified libc string
/// functions (`__builtin_object_size` backends). This crate has no
/// cheaper check than the real one, so it's identical to
/// [`malloc_object_size`].
///
/// # Safety
/// `p` must be `NULL` or a live pointer from this crate.
#[no_mangle]
pub unsafe extern "C" fn malloc_object_size_fast(p: *mut c_void) -> usize {
    match NonNull::new(p as *mut u8) {
        Some(p) => dispatch::usable_size_fast(p),
        None => 0,
    }
}

/// Releases committed-but-empty slabs back to the OS across every
/// size class. `pad` is accepted for glibc ABI compatibility and
/// ignored: this allocator's "empty slab" cache budget is controlled
/// by `SLAB_EMPTY_CACHE_BUDGET_KIB`, not by a trim-time argument.
///
/// # Safety
/// None beyond the usual requirement that the allocator not be
/// reentered from within a signal handler.
#[no_mangle]
pub unsafe extern "C" fn malloc_trim(_pad: usize) -> c_int {
    if dispatch::trim() {
        1
    } else {
        0
    }
}

/// # Safety
/// No preconditions; `mallopt` has no effect in this design (its
/// levers are environment variables read once at init instead).
#[no_mangle]
pub unsafe extern "C" fn mallopt(_param: c_int, _value: c_int) -> c_int {
    0
}

/// # Safety
/// No preconditions; a no-op, matching this allocator's choice not to
/// maintain glibc-style usage counters.
#[no_mangle]
pub unsafe extern "C" fn malloc_stats() {}

/// # Safety
/// `info` fields are zeroed; this allocator doesn't track the
/// per-arena statistics `struct mallinfo` describes.
#[no_mangle]
pub unsafe extern "C" fn mallinfo() -> MallInfo {
    MallInfo::default()
}

/// # Safety
/// `options` is accepted and ignored for ABI compatibility.
#[no_mangle]
pub unsafe extern "C" fn malloc_info(_options: c_int, _stream: *mut c_void) -> c_int {
    0
}

/// # Safety
/// Always returns `NULL`: this allocator has no opaque state blob to
/// hand back, unlike glibc's arena-based implementation.
#[no_mangle]
pub unsafe extern "C" fn malloc_get_state() -> *mut c_void {
    std::ptr::null_mut()
}

/// # Safety
/// Always fails: there is no state to restore.
#[no_mangle]
pub unsafe extern "C" fn malloc_set_state(_state: *mut c_void) -> c_int {
    -1
}

/// Layout-compatible stand-in for glibc's `struct mallinfo`. Every
/// field is `c_int` per the original ABI, even though that makes large
/// totals wrap; callers relying on exact values from this struct on a
/// hardened allocator are already off the golden path.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MallInfo {
    pub arena: c_int,
    pub ordblks: c_int,
    pub smblks: c_int,
    pub hblks: c_int,
    pub hblkhd: c_int,
    pub usmblks: c_int,
    pub fsmblks: c_int,
    pub uordblks: c_int,
    pub fordblks: c_int,
    pub keepcost: c_int,
}

//! System-allocator interface consumed by the pool.
//!
//! The pool never calls the system allocator directly; it goes through a
//! [`RawAlloc`] implementation supplied as a type parameter.  Two flavors
//! are provided: [`HeapAlloc`] over the Rust global allocator and
//! [`LibcAlloc`] over `malloc`/`free`.  Callers with bespoke block sources
//! (arenas, instrumented allocators, quota enforcement) implement the trait
//! themselves.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use super::block::MIN_ALLOC_ALIGN;

/// Source of raw memory blocks.
///
/// Implementations must not re-enter the pool that invoked them: the pool
/// is mid-mutation while these run, and the singleton layer would deadlock
/// on its own mutex.
pub trait RawAlloc {
    /// Acquire `bytes` of raw memory, or `None` when exhausted.
    ///
    /// The returned region must be aligned to at least
    /// `lcm(align_of::<*mut u8>(), align_of::<usize>())`, the strictest
    /// alignment the pool's chunk and footer layout assumes.
    fn acquire(bytes: usize) -> Option<NonNull<u8>>;

    /// Return a region to the system.
    ///
    /// # Safety
    ///
    /// `ptr` was returned by [`RawAlloc::acquire`] on this same
    /// implementation with this same `bytes`, and has not been released
    /// already.
    unsafe fn release(ptr: NonNull<u8>, bytes: usize);
}

/// Block source backed by the Rust global allocator.
pub struct HeapAlloc;

impl RawAlloc for HeapAlloc {
    fn acquire(bytes: usize) -> Option<NonNull<u8>> {
        if bytes == 0 {
            return None;
        }
        let layout = Layout::from_size_align(bytes, MIN_ALLOC_ALIGN).ok()?;
        // Safety: layout has non-zero size.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn release(ptr: NonNull<u8>, bytes: usize) {
        // acquire rejected zero and invalid layouts, so this cannot fail.
        let layout = Layout::from_size_align(bytes, MIN_ALLOC_ALIGN)
            .expect("layout was valid at acquire time");
        // Safety: ptr came from alloc::alloc with this exact layout.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

/// Block source backed by the C runtime heap.
///
/// `malloc` aligns to `max_align_t`, which satisfies the acquire contract on
/// every supported target.
pub struct LibcAlloc;

impl RawAlloc for LibcAlloc {
    fn acquire(bytes: usize) -> Option<NonNull<u8>> {
        if bytes == 0 {
            return None;
        }
        // Safety: FFI call; malloc accepts any non-zero size.
        NonNull::new(unsafe { libc::malloc(bytes) }.cast::<u8>())
    }

    unsafe fn release(ptr: NonNull<u8>, _bytes: usize) {
        // Safety: ptr came from malloc and is released exactly once.
        unsafe { libc::free(ptr.as_ptr().cast()) };
    }
}

//! Container-facing allocator façades over the process-wide pools.
//!
//! Two flavors with the same surface and different routing:
//!
//! * [`PoolAllocator`] always goes through the contiguous ordered path,
//!   which suits callers that allocate arrays (vector-like containers).
//! * [`FastPoolAllocator`] sends single-element requests down the O(1)
//!   unordered path and larger requests down the ordered path, which suits
//!   node-based containers that allocate one element at a time.
//!
//! Instances of the same flavor and element type are interchangeable: they
//! all resolve to the same underlying singleton, so equality between them is
//! constant-true and memory may be allocated through one instance and
//! deallocated through another.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use super::singleton::{GlobalPool, PoolSpec};
use super::user_alloc::{HeapAlloc, RawAlloc};

/// Allocation failure surfaced by the container façades.
///
/// The pool layer signals exhaustion with `None`; the façades turn that
/// into a proper error so container code can propagate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The user allocator refused a new block.
    OutOfMemory,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::OutOfMemory => write!(f, "pool allocation failed: out of memory"),
        }
    }
}

impl std::error::Error for PoolError {}

const POOL_ALLOCATOR_ID: &str = "segpool/pool-allocator";
const FAST_POOL_ALLOCATOR_ID: &str = "segpool/fast-pool-allocator";

fn shared_pool<T, A: RawAlloc + 'static>(id: &'static str) -> GlobalPool<A> {
    assert!(
        mem::size_of::<T>() > 0,
        "zero-sized elements cannot be pool-allocated"
    );
    // Keyed by element size: every element type of one size shares a pool.
    GlobalPool::instance(PoolSpec::new(id, mem::size_of::<T>()))
}

/// Array-friendly allocator: every request takes the contiguous ordered
/// path, so multi-element allocations and single elements interleave
/// without fragmenting each other.
pub struct PoolAllocator<T, A: RawAlloc + 'static = HeapAlloc> {
    pool: GlobalPool<A>,
    _element: PhantomData<T>,
}

impl<T, A: RawAlloc + 'static> PoolAllocator<T, A> {
    /// Handle to the shared pool for elements of this size.  Touching the
    /// instance here pins its construction to the first allocator built for
    /// the size class, not the first allocation.
    ///
    /// # Panics
    ///
    /// Panics for zero-sized `T`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: shared_pool::<T, A>(POOL_ALLOCATOR_ID),
            _element: PhantomData,
        }
    }

    /// Allocate room for `n` contiguous elements.
    ///
    /// # Errors
    ///
    /// [`PoolError::OutOfMemory`] when the backend refuses a block (or
    /// `n == 0`, which no container requests).
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, PoolError> {
        self.pool
            .ordered_alloc_n(n)
            .map(NonNull::cast)
            .ok_or(PoolError::OutOfMemory)
    }

    /// [`PoolAllocator::allocate`] with a locality hint.  The pool serves
    /// one size class from shared blocks, so the hint carries no
    /// information it can use; it is accepted and ignored.
    ///
    /// # Errors
    ///
    /// As [`PoolAllocator::allocate`].
    pub fn allocate_hint(&self, n: usize, _hint: Option<NonNull<T>>) -> Result<NonNull<T>, PoolError> {
        self.allocate(n)
    }

    /// Return `n` contiguous elements' worth of memory.
    ///
    /// # Safety
    ///
    /// `ptr` was returned by [`PoolAllocator::allocate`] (any instance of
    /// this same flavor and element size) with the same `n`, and is not
    /// already deallocated.  The elements themselves must already be
    /// dropped; this returns raw memory only.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) {
        // Safety: upheld by caller.
        unsafe { self.pool.ordered_free_n(ptr.cast(), n) };
    }

    /// Largest element count any request could meaningfully name.
    #[must_use]
    pub fn max_size() -> usize {
        usize::MAX / mem::size_of::<T>()
    }
}

impl<T, A: RawAlloc + 'static> Default for PoolAllocator<T, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A: RawAlloc + 'static> Clone for PoolAllocator<T, A> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _element: PhantomData,
        }
    }
}

// All instances share one singleton, so any instance can deallocate what
// another allocated.
impl<T, A: RawAlloc + 'static> PartialEq for PoolAllocator<T, A> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<T, A: RawAlloc + 'static> Eq for PoolAllocator<T, A> {}

impl<T, A: RawAlloc + 'static> fmt::Debug for PoolAllocator<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator").finish()
    }
}

/// Node-friendly allocator: single-element requests take the O(1)
/// unordered path; multi-element requests fall back to the ordered path.
///
/// Mixing the two shapes on one size class works but degrades the ordered
/// discipline the contiguous search relies on; callers that mostly allocate
/// arrays should prefer [`PoolAllocator`].
pub struct FastPoolAllocator<T, A: RawAlloc + 'static = HeapAlloc> {
    pool: GlobalPool<A>,
    _element: PhantomData<T>,
}

impl<T, A: RawAlloc + 'static> FastPoolAllocator<T, A> {
    /// Handle to the shared pool for elements of this size.
    ///
    /// # Panics
    ///
    /// Panics for zero-sized `T`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pool: shared_pool::<T, A>(FAST_POOL_ALLOCATOR_ID),
            _element: PhantomData,
        }
    }

    /// Allocate room for one element.
    ///
    /// # Errors
    ///
    /// [`PoolError::OutOfMemory`] when the backend refuses a block.
    pub fn allocate_one(&self) -> Result<NonNull<T>, PoolError> {
        self.pool
            .alloc()
            .map(NonNull::cast)
            .ok_or(PoolError::OutOfMemory)
    }

    /// Allocate room for `n` elements; `n == 1` takes the fast path.
    ///
    /// # Errors
    ///
    /// As [`FastPoolAllocator::allocate_one`].
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, PoolError> {
        if n == 1 {
            return self.allocate_one();
        }
        self.pool
            .ordered_alloc_n(n)
            .map(NonNull::cast)
            .ok_or(PoolError::OutOfMemory)
    }

    /// [`FastPoolAllocator::allocate`] with an ignored locality hint.
    ///
    /// # Errors
    ///
    /// As [`FastPoolAllocator::allocate`].
    pub fn allocate_hint(&self, n: usize, _hint: Option<NonNull<T>>) -> Result<NonNull<T>, PoolError> {
        self.allocate(n)
    }

    /// Return one element's worth of memory.
    ///
    /// # Safety
    ///
    /// `ptr` was returned by a single-element allocate on this flavor and
    /// element size and is not already deallocated; the element must
    /// already be dropped.
    pub unsafe fn deallocate_one(&self, ptr: NonNull<T>) {
        // Safety: upheld by caller.
        unsafe { self.pool.free(ptr.cast()) };
    }

    /// Return `n` elements' worth of memory; `n == 1` takes the fast path.
    ///
    /// # Safety
    ///
    /// `ptr` was returned by an allocate on this flavor and element size
    /// with the same `n`, and is not already deallocated; elements must
    /// already be dropped.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) {
        // Safety: upheld by caller.
        unsafe {
            if n == 1 {
                self.pool.free(ptr.cast());
            } else {
                self.pool.ordered_free_n(ptr.cast(), n);
            }
        }
    }

    /// Largest element count any request could meaningfully name.
    #[must_use]
    pub fn max_size() -> usize {
        usize::MAX / mem::size_of::<T>()
    }
}

impl<T, A: RawAlloc + 'static> Default for FastPoolAllocator<T, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A: RawAlloc + 'static> Clone for FastPoolAllocator<T, A> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _element: PhantomData,
        }
    }
}

impl<T, A: RawAlloc + 'static> PartialEq for FastPoolAllocator<T, A> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<T, A: RawAlloc + 'static> Eq for FastPoolAllocator<T, A> {}

impl<T, A: RawAlloc + 'static> fmt::Debug for FastPoolAllocator<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastPoolAllocator").finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn pool_allocator_serves_contiguous_arrays() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = PoolAllocator::<u64, HeapAlloc>::new();
        let ptr = alloc.allocate(8).expect("array alloc failed");

        // All eight slots are writable and contiguous at element stride.
        // Safety: the span covers 8 elements.
        unsafe {
            for i in 0..8 {
                ptr.as_ptr().add(i).write(i as u64 * 3);
            }
            for i in 0..8 {
                assert_eq!(ptr.as_ptr().add(i).read(), i as u64 * 3);
            }
            alloc.deallocate(ptr, 8);
        }
    }

    #[test]
    fn fast_allocator_single_and_batch_paths() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let alloc = FastPoolAllocator::<u32, HeapAlloc>::new();

        let one = alloc.allocate(1).expect("single alloc failed");
        let batch = alloc.allocate(6).expect("batch alloc failed");
        // Safety: both spans are live.
        unsafe {
            one.as_ptr().write(99);
            for i in 0..6 {
                batch.as_ptr().add(i).write(i as u32);
            }
            assert_eq!(one.as_ptr().read(), 99);

            alloc.deallocate(one, 1);
            alloc.deallocate(batch, 6);
        }

        let again = alloc.allocate_one().expect("re-alloc failed");
        // Safety: live chunk from this allocator.
        unsafe { alloc.deallocate_one(again) };
    }

    #[test]
    fn instances_are_interchangeable_and_equal() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let a = PoolAllocator::<u16, HeapAlloc>::new();
        let b = PoolAllocator::<u16, HeapAlloc>::new();
        assert_eq!(a, b);
        assert_eq!(a.clone(), b);

        // Cross-instance deallocation: allocate with a, free with b.
        let p = a.allocate(4).unwrap();
        // Safety: same singleton behind both instances.
        unsafe { b.deallocate(p, 4) };

        let fa = FastPoolAllocator::<u16, HeapAlloc>::new();
        let fb = FastPoolAllocator::<u16, HeapAlloc>::new();
        assert_eq!(fa, fb);
    }

    #[test]
    fn flavors_do_not_share_pools() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Same element size, different flavor tags: chunks from one flavor
        // are foreign to the other.
        let pa = PoolAllocator::<u64, HeapAlloc>::new();
        let p = pa.allocate(1).unwrap();
        let probe = GlobalPool::<HeapAlloc>::instance(PoolSpec::new(
            FAST_POOL_ALLOCATOR_ID,
            mem::size_of::<u64>(),
        ));
        assert!(!probe.is_from(p.cast()));
        // Safety: p came from the pool flavor.
        unsafe { pa.deallocate(p, 1) };
    }

    #[test]
    fn exhaustion_surfaces_as_an_error() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        struct TinyAlloc;
        impl RawAlloc for TinyAlloc {
            fn acquire(bytes: usize) -> Option<NonNull<u8>> {
                if bytes > 2000 {
                    None
                } else {
                    HeapAlloc::acquire(bytes)
                }
            }
            unsafe fn release(ptr: NonNull<u8>, bytes: usize) {
                // Safety: forwarded contract.
                unsafe { HeapAlloc::release(ptr, bytes) }
            }
        }

        // 4 KB elements over a backend that refuses anything past 2000
        // bytes: the very first block request fails.
        let alloc = PoolAllocator::<[u8; 4096], TinyAlloc>::new();
        assert_eq!(alloc.allocate(1), Err(PoolError::OutOfMemory));
        assert_eq!(
            alloc.allocate_hint(2, None),
            Err(PoolError::OutOfMemory)
        );
    }

    #[test]
    fn max_size_scales_with_element_width() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        assert_eq!(
            PoolAllocator::<u8, HeapAlloc>::max_size(),
            usize::MAX
        );
        assert_eq!(
            FastPoolAllocator::<u64, HeapAlloc>::max_size(),
            usize::MAX / 8
        );
    }

    #[test]
    fn error_formats_for_display() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        assert_eq!(
            PoolError::OutOfMemory.to_string(),
            "pool allocation failed: out of memory"
        );
    }
}

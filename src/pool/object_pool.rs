//! Typed pool façade: fixed-size chunks sized for one element type, with
//! construction, destruction, and teardown that finalizes leaked elements.
//!
//! The underlying pool runs in ordered mode throughout, so teardown can walk
//! the block list and the free list in lockstep and tell exactly which
//! chunks still hold live elements.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use super::block::MIN_ALLOC_ALIGN;
use super::byte_pool::{Pool, DEFAULT_NEXT_SIZE};
use super::free_list;
use super::user_alloc::{HeapAlloc, RawAlloc};

/// Failure from [`ObjectPool::try_construct_with`].
#[derive(Debug)]
pub enum ConstructError<E> {
    /// The backend refused a new block.
    OutOfMemory,
    /// The element initialiser failed; the chunk went back to the pool.
    Init(E),
}

impl<E: fmt::Display> fmt::Display for ConstructError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstructError::OutOfMemory => write!(f, "object pool exhausted"),
            ConstructError::Init(e) => write!(f, "element initialiser failed: {e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ConstructError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConstructError::OutOfMemory => None,
            ConstructError::Init(e) => Some(e),
        }
    }
}

/// A pool of `T`-sized chunks that remembers which chunks hold live
/// elements long enough to finalize every leaked one at drop time.
///
/// Pointers handed out by [`construct`](ObjectPool::construct) are owned by
/// the caller until passed to [`destroy`](ObjectPool::destroy), or until
/// the pool itself drops, at which point every element never destroyed is
/// finalized exactly once and all blocks are released.
pub struct ObjectPool<T, A: RawAlloc = HeapAlloc> {
    pool: Pool<A>,
    _element: PhantomData<T>,
}

impl<T, A: RawAlloc> ObjectPool<T, A> {
    /// New empty pool for elements of type `T`, growing from
    /// [`DEFAULT_NEXT_SIZE`] chunks with no cap.
    ///
    /// # Panics
    ///
    /// Panics for zero-sized `T`, and for `T` whose alignment exceeds what
    /// the user-allocator contract guarantees (the word alignment shared by
    /// pointers and the size integer).
    #[must_use]
    pub fn new() -> Self {
        Self::with_sizes(DEFAULT_NEXT_SIZE, 0)
    }

    /// New empty pool with explicit growth parameters (see
    /// [`Pool::with_sizes`]).
    ///
    /// # Panics
    ///
    /// As [`ObjectPool::new`], plus zero `next_size`.
    #[must_use]
    pub fn with_sizes(next_size: usize, max_size: usize) -> Self {
        assert!(mem::size_of::<T>() > 0, "zero-sized elements cannot be pooled");
        assert!(
            mem::align_of::<T>() <= MIN_ALLOC_ALIGN,
            "element alignment {} exceeds the {} bytes the block source guarantees",
            mem::align_of::<T>(),
            MIN_ALLOC_ALIGN,
        );
        Self {
            pool: Pool::with_sizes(mem::size_of::<T>(), next_size, max_size),
            _element: PhantomData,
        }
    }

    /// Allocate room for one element without initializing it.  The chunk
    /// stays raw until written; prefer [`construct`](ObjectPool::construct).
    pub fn alloc(&mut self) -> Option<NonNull<T>> {
        self.pool.ordered_alloc().map(NonNull::cast)
    }

    /// Return an uninitialized chunk obtained from [`alloc`](ObjectPool::alloc).
    ///
    /// # Safety
    ///
    /// `chunk` came from this pool, is not already free, and holds no live
    /// element (either never written, or already dropped).
    pub unsafe fn free(&mut self, chunk: NonNull<T>) {
        // Safety: upheld by caller.
        unsafe { self.pool.ordered_free(chunk.cast()) };
    }

    /// Allocate a chunk and move `value` into it.  `None` when the backend
    /// is exhausted (the value is dropped in that case).
    pub fn construct(&mut self, value: T) -> Option<NonNull<T>> {
        let chunk = self.pool.ordered_alloc()?.cast::<T>();
        // Safety: the chunk spans at least size_of::<T>() bytes and is
        // aligned for T (checked at construction).
        unsafe { chunk.as_ptr().write(value) };
        Some(chunk)
    }

    /// Allocate a chunk and initialize it from `init`.  When the
    /// initialiser fails the chunk goes straight back to the pool and the
    /// failure is passed through.
    pub fn try_construct_with<F, E>(&mut self, init: F) -> Result<NonNull<T>, ConstructError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let chunk = self
            .pool
            .ordered_alloc()
            .ok_or(ConstructError::OutOfMemory)?
            .cast::<T>();
        match init() {
            Ok(value) => {
                // Safety: as in construct.
                unsafe { chunk.as_ptr().write(value) };
                Ok(chunk)
            }
            Err(e) => {
                // Safety: the chunk came from this pool and was never
                // written.
                unsafe { self.pool.ordered_free(chunk.cast()) };
                Err(ConstructError::Init(e))
            }
        }
    }

    /// Finalize the element and return its chunk.
    ///
    /// # Safety
    ///
    /// `element` came from [`construct`](ObjectPool::construct) (or was
    /// written after [`alloc`](ObjectPool::alloc)) on this pool and has not
    /// been destroyed or freed already.
    pub unsafe fn destroy(&mut self, element: NonNull<T>) {
        // Safety: upheld by caller.
        unsafe {
            ptr::drop_in_place(element.as_ptr());
            self.pool.ordered_free(element.cast());
        }
    }

    /// True iff `element` points into this pool's chunk areas.  Not
    /// meaningful for arbitrary pointers.
    #[must_use]
    pub fn is_from(&self, element: NonNull<T>) -> bool {
        self.pool.is_from(element.cast())
    }

    #[must_use]
    pub fn next_size(&self) -> usize {
        self.pool.next_size()
    }

    /// See [`Pool::set_next_size`].
    ///
    /// # Panics
    ///
    /// Panics if `next_size` is 0.
    pub fn set_next_size(&mut self, next_size: usize) {
        self.pool.set_next_size(next_size);
    }
}

impl<T, A: RawAlloc> Default for ObjectPool<T, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A: RawAlloc> Drop for ObjectPool<T, A> {
    fn drop(&mut self) {
        let mut block = self.pool.block_list();
        if !block.valid() {
            return;
        }
        let partition = self.pool.alloc_size();
        let mut freed = self.pool.free_head();

        // Both lists are address-ordered, so a single cursor over the free
        // list identifies the free chunks of each block in turn; everything
        // else still holds a live element.
        // Safety: blocks and free chunks are live until their block is
        // released, and each footer is read before the release.
        unsafe {
            while block.valid() {
                let next = block.next();
                let mut i = block.base();
                while i != block.end() {
                    if i == freed {
                        freed = free_list::next_of(freed);
                    } else {
                        ptr::drop_in_place(i.cast::<T>());
                    }
                    i = i.add(partition);
                }
                Pool::<A>::note_block_released(block.total_size());
                A::release(NonNull::new_unchecked(block.base()), block.total_size());
                block = next;
            }
        }

        // Blocks are gone; keep the inherited purge from touching them.
        self.pool.forget_all_blocks();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn construct_and_destroy_roundtrip() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = ObjectPool::<u64, HeapAlloc>::new();
        let a = pool.construct(11).unwrap();
        let b = pool.construct(22).unwrap();
        assert_ne!(a, b);
        assert!(pool.is_from(a));
        assert!(pool.is_from(b));

        // Safety: both pointers are live elements from this pool.
        unsafe {
            assert_eq!(*a.as_ptr(), 11);
            assert_eq!(*b.as_ptr(), 22);
            pool.destroy(a);
            pool.destroy(b);
        }
    }

    #[test]
    fn destroy_runs_the_finalizer() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Tracked(#[allow(dead_code)] u64);
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut pool = ObjectPool::<Tracked, HeapAlloc>::new();
        let p = pool.construct(Tracked(0)).unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);
        // Safety: p is a live element from this pool.
        unsafe { pool.destroy(p) };
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_finalizes_leaked_elements_exactly_once() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Tracked(#[allow(dead_code)] u64);
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let mut pool = ObjectPool::<Tracked, HeapAlloc>::new();
            let elements: Vec<NonNull<Tracked>> =
                (0..10).map(|_| pool.construct(Tracked(0)).unwrap()).collect();

            // Destroy three explicitly; leak the other seven.
            // Safety: live elements from this pool.
            unsafe {
                pool.destroy(elements[1]);
                pool.destroy(elements[4]);
                pool.destroy(elements[8]);
            }
            assert_eq!(DROPS.load(Ordering::SeqCst), 3);
        }

        assert_eq!(DROPS.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn teardown_of_untouched_pool_is_quiet() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Tracked(#[allow(dead_code)] u64);
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        drop(ObjectPool::<Tracked, HeapAlloc>::new());
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);

        // A pool whose every element was destroyed finalizes nothing more.
        {
            let mut pool = ObjectPool::<Tracked, HeapAlloc>::new();
            let p = pool.construct(Tracked(0)).unwrap();
            // Safety: live element from this pool.
            unsafe { pool.destroy(p) };
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_initialiser_returns_the_chunk() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = ObjectPool::<u32, HeapAlloc>::with_sizes(4, 0);

        let err = pool
            .try_construct_with(|| Err::<u32, &str>("nope"))
            .unwrap_err();
        assert!(matches!(err, ConstructError::Init("nope")));

        // The failed chunk is back on the free list; the next construct
        // reuses it (head of a fresh ordered block).
        let ok = pool.try_construct_with(|| Ok::<u32, &str>(7)).unwrap();
        // Safety: live element from this pool.
        unsafe {
            assert_eq!(*ok.as_ptr(), 7);
            pool.destroy(ok);
        }
    }

    #[test]
    fn alloc_free_passthrough() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = ObjectPool::<[u8; 24], HeapAlloc>::with_sizes(2, 0);
        let raw = pool.alloc().unwrap();
        assert!(pool.is_from(raw));
        // Safety: raw chunk from this pool, never written.
        unsafe { pool.free(raw) };
    }

    #[test]
    fn next_size_controls_pass_through() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let mut pool = ObjectPool::<u64, HeapAlloc>::new();
        assert_eq!(pool.next_size(), DEFAULT_NEXT_SIZE);
        pool.set_next_size(5);
        assert_eq!(pool.next_size(), 5);
    }

    #[test]
    #[should_panic(expected = "alignment")]
    fn over_aligned_elements_are_rejected() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        #[repr(align(64))]
        struct Wide(#[allow(dead_code)] u8);
        let _ = ObjectPool::<Wide, HeapAlloc>::new();
    }
}

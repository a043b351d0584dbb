//! Fixed-size-chunk pool: a growing list of system blocks feeding an
//! intrusive free list.
//!
//! A [`Pool`] serves chunks of one size class.  Every chunk it hands out has
//! the same footprint, `alloc_size()`, derived once from the requested size
//! so that any chunk can hold a free-list link and any array of chunks keeps
//! every element properly placed.  When the free list runs dry the pool
//! acquires one block from its [`RawAlloc`] backend, sized by a doubling
//! policy, partitions it, and keeps going.
//!
//! The unordered entry points (`alloc`/`free`) are O(1).  The ordered entry
//! points keep the free list and the block list sorted by address, which is
//! what makes contiguous multi-chunk allocation (`ordered_alloc_n`) and
//! whole-block reclamation (`release_memory`) possible.  The two families
//! can be mixed only in the direction ordered → unordered; once an
//! unordered free has run, ordered operations are off the table until the
//! pool is purged.
//!
//! `Pool` is a single-mutator structure: no internal locking, no atomics on
//! the allocation path.  Cross-thread sharing is layered on top by
//! [`GlobalPool`](super::singleton::GlobalPool).

use std::cmp;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

use super::block::{Block, BLOCK_FOOTER_SIZE, MIN_CHUNK_SIZE};
use super::free_list::{next_of, set_next_of, FreeList};
use super::math::lcm;
use super::stats;
use super::user_alloc::{HeapAlloc, RawAlloc};

/// Chunks requested from the backend on the first growth when the caller
/// does not say otherwise.
pub const DEFAULT_NEXT_SIZE: usize = 32;

/// Debug-build shadow of one block's allocation state: a set bit means the
/// chunk is free.  Lets every free/alloc transition be validated against
/// double frees and foreign pointers without touching the release-build
/// layout.
#[cfg(debug_assertions)]
struct ChunkGuard {
    base: usize,
    partition: usize,
    free: FixedBitSet,
}

/// A pool of fixed-size chunks carved out of backend-allocated blocks.
///
/// `A` is the block source; it defaults to the Rust global allocator.
pub struct Pool<A: RawAlloc = HeapAlloc> {
    /// Intrusive free list threaded through unallocated chunks.
    store: FreeList,
    /// Head of the block list (invalid when no block is held).
    list: Block,
    requested_size: usize,
    /// True per-chunk footprint: lcm of the requested size and the word
    /// granularity shared by pointers and the size integer.
    partition_size: usize,
    /// Chunks to request on the next growth.
    next_size: usize,
    /// Value `next_size` resets to after release/purge.
    start_size: usize,
    /// Cap on `next_size` in chunks of `requested_size`; 0 means unbounded.
    max_size: usize,
    #[cfg(debug_assertions)]
    guards: Vec<ChunkGuard>,
    _backend: PhantomData<A>,
}

// Safety: the pool owns every block it holds; the raw pointers inside are
// not shared with any other owner.
unsafe impl<A: RawAlloc> Send for Pool<A> {}

impl<A: RawAlloc> Pool<A> {
    /// New empty pool serving chunks of `requested_size` bytes, growing from
    /// [`DEFAULT_NEXT_SIZE`] chunks with no cap.
    ///
    /// # Panics
    ///
    /// Panics if `requested_size` is 0.
    #[must_use]
    pub fn new(requested_size: usize) -> Self {
        Self::with_sizes(requested_size, DEFAULT_NEXT_SIZE, 0)
    }

    /// New empty pool with explicit growth parameters: `next_size` chunks on
    /// the first growth, doubling up to `max_size` chunks per block
    /// (0 = unbounded).
    ///
    /// # Panics
    ///
    /// Panics if `requested_size` or `next_size` is 0.
    #[must_use]
    pub fn with_sizes(requested_size: usize, next_size: usize, max_size: usize) -> Self {
        assert!(requested_size > 0, "requested_size must be nonzero");
        assert!(next_size > 0, "next_size must be nonzero");
        Self {
            store: FreeList::new(),
            list: Block::invalid(),
            requested_size,
            partition_size: lcm(requested_size, MIN_CHUNK_SIZE),
            next_size,
            start_size: next_size,
            max_size,
            #[cfg(debug_assertions)]
            guards: Vec::new(),
            _backend: PhantomData,
        }
    }

    /// Footprint of every chunk this pool hands out.  At least
    /// `requested_size` and at least pointer-sized, always a multiple of
    /// pointer alignment.
    #[must_use]
    pub fn alloc_size(&self) -> usize {
        self.partition_size
    }

    /// The chunk size passed at construction; never changes.
    #[must_use]
    pub fn requested_size(&self) -> usize {
        self.requested_size
    }

    /// Chunks the next growth will request.  Never 0.
    #[must_use]
    pub fn next_size(&self) -> usize {
        self.next_size
    }

    /// Set the chunk count for the next growth; also becomes the value
    /// `next_size` resets to after release/purge.
    ///
    /// # Panics
    ///
    /// Panics if `next_size` is 0.
    pub fn set_next_size(&mut self, next_size: usize) {
        assert!(next_size > 0, "next_size must be nonzero");
        self.next_size = next_size;
        self.start_size = next_size;
    }

    /// Cap on the doubling policy, in chunks of `requested_size`; 0 means
    /// unbounded.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    /// Chunks needed to cover `n` elements of `requested_size`, rounded up
    /// to whole partitions.  `None` on byte-count overflow.
    fn chunks_for(&self, n: usize) -> Option<usize> {
        let total = n.checked_mul(self.requested_size)?;
        Some(total / self.partition_size + usize::from(total % self.partition_size != 0))
    }

    /// Allocate one chunk.  Amortized O(1).  Returns `None` only when the
    /// backend refuses a new block; the pool is unchanged in that case.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        if !self.store.is_empty() {
            // Safety: the store is non-empty and holds only live chunks.
            let chunk = unsafe { self.store.alloc() };
            #[cfg(debug_assertions)]
            self.guard_mark_allocated(chunk);
            return NonNull::new(chunk);
        }
        self.grow_then_alloc(false)
    }

    /// Allocate one chunk, keeping the free list and block list ordered.
    /// Same failure behavior as [`Pool::alloc`].
    pub fn ordered_alloc(&mut self) -> Option<NonNull<u8>> {
        if !self.store.is_empty() {
            // Safety: as in alloc.
            let chunk = unsafe { self.store.alloc() };
            #[cfg(debug_assertions)]
            self.guard_mark_allocated(chunk);
            return NonNull::new(chunk);
        }
        self.grow_then_alloc(true)
    }

    /// Allocate `n * requested_size` bytes as contiguous chunks.  Scans the
    /// ordered free list for a long-enough run first; otherwise acquires one
    /// block sized for at least the request and hands back its leading
    /// chunks.  O(free-list length).
    ///
    /// Unlike the single-chunk path, a growth here doubles `next_size`
    /// without consulting `max_size`; a large contiguous request is not
    /// treated as pressure toward the steady-state block size.
    pub fn ordered_alloc_n(&mut self, n: usize) -> Option<NonNull<u8>> {
        if n == 0 {
            return None;
        }
        let partition = self.partition_size;
        let num_chunks = self.chunks_for(n)?;

        // Safety: ordered free list, matching partition size.
        let found = unsafe { self.store.alloc_n(num_chunks, partition) };
        if !found.is_null() {
            #[cfg(debug_assertions)]
            for i in 0..num_chunks {
                // Safety: the run spans num_chunks live chunks.
                self.guard_mark_allocated(unsafe { found.add(i * partition) });
            }
            return NonNull::new(found);
        }

        self.next_size = cmp::max(self.next_size, num_chunks);
        let block_size = self
            .next_size
            .checked_mul(partition)?
            .checked_add(BLOCK_FOOTER_SIZE)?;
        let ptr = A::acquire(block_size)?;
        let node = Block::new(ptr.as_ptr(), block_size);

        // Safety: the region was just acquired; the leading num_chunks
        // chunks are reserved for the caller and only the tail excess joins
        // the free list.
        unsafe {
            if self.next_size > num_chunks {
                self.store.add_ordered_block(
                    node.base().add(num_chunks * partition),
                    node.element_size() - num_chunks * partition,
                    partition,
                );
            }
            self.next_size <<= 1;
            self.insert_block_ordered(node);
        }
        Self::note_block_acquired(block_size);
        #[cfg(debug_assertions)]
        self.guard_track_block(node.base(), node.element_size(), num_chunks);

        NonNull::new(node.base())
    }

    /// Return one chunk.  O(1).
    ///
    /// # Safety
    ///
    /// `chunk` was returned by an alloc on this pool and is not already
    /// free.
    pub unsafe fn free(&mut self, chunk: NonNull<u8>) {
        #[cfg(debug_assertions)]
        self.guard_mark_freed(chunk.as_ptr());
        // Safety: upheld by caller.
        unsafe { self.store.free(chunk.as_ptr()) };
    }

    /// Return one chunk at its address-sorted position.  O(free-list
    /// length).
    ///
    /// # Safety
    ///
    /// Same as [`Pool::free`]; additionally the free list must be ordered.
    pub unsafe fn ordered_free(&mut self, chunk: NonNull<u8>) {
        #[cfg(debug_assertions)]
        self.guard_mark_freed(chunk.as_ptr());
        // Safety: upheld by caller.
        unsafe { self.store.ordered_free(chunk.as_ptr()) };
    }

    /// Return a contiguous range covering `n` elements.
    ///
    /// # Safety
    ///
    /// `chunks` was returned by [`Pool::ordered_alloc_n`] on this pool with
    /// the same `n`, and no chunk of the range is already free.
    pub unsafe fn free_n(&mut self, chunks: NonNull<u8>, n: usize) {
        let partition = self.partition_size;
        let total = n * self.requested_size;
        let num_chunks = total / partition + usize::from(total % partition != 0);
        #[cfg(debug_assertions)]
        for i in 0..num_chunks {
            // Safety: the range spans num_chunks chunks per precondition.
            self.guard_mark_freed(unsafe { chunks.as_ptr().add(i * partition) });
        }
        // Safety: upheld by caller.
        unsafe { self.store.free_n(chunks.as_ptr(), num_chunks, partition) };
    }

    /// Ordered variant of [`Pool::free_n`].
    ///
    /// # Safety
    ///
    /// Same as [`Pool::free_n`]; additionally the free list must be ordered.
    pub unsafe fn ordered_free_n(&mut self, chunks: NonNull<u8>, n: usize) {
        let partition = self.partition_size;
        let total = n * self.requested_size;
        let num_chunks = total / partition + usize::from(total % partition != 0);
        #[cfg(debug_assertions)]
        for i in 0..num_chunks {
            // Safety: as in free_n.
            self.guard_mark_freed(unsafe { chunks.as_ptr().add(i * partition) });
        }
        // Safety: upheld by caller.
        unsafe {
            self.store
                .ordered_free_n(chunks.as_ptr(), num_chunks, partition)
        };
    }

    /// True iff `chunk` lies in some block's chunk area, meaning it was
    /// returned by this pool or may be returned by a future allocation from
    /// it.  Not meaningful for arbitrary pointers.
    #[must_use]
    pub fn is_from(&self, chunk: NonNull<u8>) -> bool {
        self.find_block(chunk.as_ptr()).valid()
    }

    /// Release every block whose chunks are all free.  Requires the ordered
    /// discipline (both lists sorted).  Returns true iff at least one block
    /// went back to the backend.  Resets `next_size` to its starting value.
    /// O(total chunks).
    pub fn release_memory(&mut self) -> bool {
        let mut released = false;
        let partition = self.partition_size;

        // Parallel cursors: (prev, ptr) over the block list, and
        // (prev_free, free) over the free list, where prev_free is the last
        // free chunk before the current block, not the list predecessor.
        let mut ptr = self.list;
        let mut prev = Block::invalid();
        let mut free = self.store.head();
        let mut prev_free: *mut u8 = ptr::null_mut();

        // Safety: every pointer walked is a live block footer or a live
        // free chunk; releases happen only after the block is unlinked from
        // both lists.
        unsafe {
            while ptr.valid() {
                // No free chunks left means every remaining block is fully
                // allocated.
                if free.is_null() {
                    break;
                }

                // A block is releasable iff its chunks appear back-to-back
                // at the free cursor.
                let mut all_chunks_free = true;
                let saved_free = free;
                let mut i = ptr.base();
                while i != ptr.end() {
                    if i != free {
                        all_chunks_free = false;
                        // The cursor may have walked into a later block;
                        // rewind so the skip below starts from this one.
                        free = saved_free;
                        break;
                    }
                    free = next_of(free);
                    i = i.add(partition);
                }

                let next = ptr.next();

                if all_chunks_free {
                    // Unlink from the block list.
                    if prev.valid() {
                        prev.set_next(next);
                    } else {
                        self.list = next;
                    }
                    // Excise the block's chunks from the free list.
                    if prev_free.is_null() {
                        self.store.set_head(free);
                    } else {
                        set_next_of(prev_free, free);
                    }
                    #[cfg(debug_assertions)]
                    self.guard_untrack_block(ptr.base());
                    Self::note_block_released(ptr.total_size());
                    // Safety: the region was acquired with this exact size.
                    A::release(NonNull::new_unchecked(ptr.base()), ptr.total_size());
                    released = true;
                } else {
                    // Skip the free cursor past this block's region.
                    if Self::contains(free, ptr.base(), ptr.element_size()) {
                        let end = ptr.end();
                        loop {
                            prev_free = free;
                            free = next_of(free);
                            if free.is_null() || free.addr() >= end.addr() {
                                break;
                            }
                        }
                    }
                    prev = ptr;
                }

                ptr = next;
            }
        }

        self.next_size = self.start_size;
        released
    }

    /// Release every block unconditionally, invalidating all outstanding
    /// allocations.  Returns true iff any block existed.
    pub fn purge_memory(&mut self) -> bool {
        let mut iter = self.list;
        if !iter.valid() {
            return false;
        }
        // Safety: each footer is read before its region is released.
        unsafe {
            loop {
                let next = iter.next();
                Self::note_block_released(iter.total_size());
                A::release(NonNull::new_unchecked(iter.base()), iter.total_size());
                iter = next;
                if !iter.valid() {
                    break;
                }
            }
        }
        self.list = Block::invalid();
        self.store.set_head(ptr::null_mut());
        #[cfg(debug_assertions)]
        self.guards.clear();
        self.next_size = self.start_size;
        true
    }

    // -----------------------------------------------------------------
    // internals
    // -----------------------------------------------------------------

    /// Acquire one block of `next_size` chunks, apply the growth policy,
    /// merge the chunks into the free list, link the block, and pop one
    /// chunk.  `None` on backend exhaustion or size overflow, with no state
    /// change.
    fn grow_then_alloc(&mut self, ordered: bool) -> Option<NonNull<u8>> {
        let partition = self.partition_size;
        let block_size = self
            .next_size
            .checked_mul(partition)?
            .checked_add(BLOCK_FOOTER_SIZE)?;
        let ptr = A::acquire(block_size)?;
        let node = Block::new(ptr.as_ptr(), block_size);

        // Double the next request.  With a cap, the second branch ramps up
        // to the cap (expressed in chunks of requested_size) and the final
        // else holds next_size steady once the cap is reached.
        if self.max_size == 0 {
            self.next_size <<= 1;
        } else if self.next_size * partition / self.requested_size < self.max_size {
            self.next_size = cmp::min(
                self.next_size << 1,
                self.max_size * self.requested_size / partition,
            );
        }

        // Safety: the region was just acquired with room for the chunk area
        // plus footer; segregation stays inside the chunk area.
        unsafe {
            if ordered {
                // The merge is ordered even though the free list is empty
                // here, so the invariant survives future list states too.
                self.store
                    .add_ordered_block(node.base(), node.element_size(), partition);
                self.insert_block_ordered(node);
            } else {
                self.store
                    .add_block(node.base(), node.element_size(), partition);
                node.set_next(self.list);
                self.list = node;
            }
        }
        Self::note_block_acquired(block_size);
        #[cfg(debug_assertions)]
        self.guard_track_block(node.base(), node.element_size(), 0);

        // Safety: segregation just made the store non-empty.
        let chunk = unsafe { self.store.alloc() };
        #[cfg(debug_assertions)]
        self.guard_mark_allocated(chunk);
        NonNull::new(chunk)
    }

    /// Link `node` into the block list at its address-sorted position.
    ///
    /// # Safety
    ///
    /// `node` is valid with a live region; the block list is ordered.
    unsafe fn insert_block_ordered(&mut self, node: Block) {
        // Safety: footer reads/writes stay on live blocks.
        unsafe {
            if !self.list.valid() || self.list.base().addr() > node.base().addr() {
                node.set_next(self.list);
                self.list = node;
            } else {
                let mut prev = self.list;
                loop {
                    let next_ptr = prev.next_ptr();
                    if next_ptr.is_null() || next_ptr.addr() > node.base().addr() {
                        break;
                    }
                    prev = prev.next();
                }
                node.set_next(prev.next());
                prev.set_next(node);
            }
        }
    }

    /// Block whose chunk area contains `chunk`, or an invalid handle.
    fn find_block(&self, chunk: *mut u8) -> Block {
        let mut iter = self.list;
        // Safety: walks live block footers only.
        unsafe {
            while iter.valid() {
                if Self::contains(chunk, iter.base(), iter.element_size()) {
                    return iter;
                }
                iter = iter.next();
            }
        }
        iter
    }

    /// Address-interval membership: inclusive lower bound, exclusive upper.
    fn contains(chunk: *mut u8, base: *mut u8, len: usize) -> bool {
        base.addr() <= chunk.addr() && chunk.addr() < base.addr() + len
    }

    fn note_block_acquired(bytes: usize) {
        stats::BYTES_ACQUIRED.add(bytes);
        stats::BLOCKS_LIVE.add(1);
    }

    pub(crate) fn note_block_released(bytes: usize) {
        stats::sub_saturating(&stats::BYTES_ACQUIRED, bytes);
        stats::sub_saturating(&stats::BLOCKS_LIVE, 1);
    }

    pub(crate) fn block_list(&self) -> Block {
        self.list
    }

    pub(crate) fn free_head(&self) -> *mut u8 {
        self.store.head()
    }

    /// Drop every record of held blocks without releasing them.  For callers
    /// that walked the block list and released the regions themselves.
    pub(crate) fn forget_all_blocks(&mut self) {
        self.list = Block::invalid();
        self.store.set_head(ptr::null_mut());
        #[cfg(debug_assertions)]
        self.guards.clear();
    }

    // -----------------------------------------------------------------
    // debug-build allocation-state shadow
    // -----------------------------------------------------------------

    #[cfg(debug_assertions)]
    fn guard_track_block(&mut self, base: *mut u8, element_size: usize, live_prefix: usize) {
        let n = element_size / self.partition_size;
        let mut free = FixedBitSet::with_capacity(n);
        free.insert_range(live_prefix..n);
        self.guards.push(ChunkGuard {
            base: base.addr(),
            partition: self.partition_size,
            free,
        });
    }

    #[cfg(debug_assertions)]
    fn guard_locate(&mut self, p: *mut u8) -> (&mut ChunkGuard, usize) {
        let a = p.addr();
        for g in &mut self.guards {
            let len = g.free.len() * g.partition;
            if g.base <= a && a < g.base + len {
                let offset = a - g.base;
                assert!(
                    offset.is_multiple_of(g.partition),
                    "pointer {p:p} is not chunk-aligned for this pool",
                );
                let idx = offset / g.partition;
                return (g, idx);
            }
        }
        panic!("pointer {p:p} does not belong to this pool");
    }

    #[cfg(debug_assertions)]
    fn guard_mark_allocated(&mut self, p: *mut u8) {
        let (g, i) = self.guard_locate(p);
        assert!(g.free.contains(i), "chunk {p:p} handed out twice");
        g.free.set(i, false);
    }

    #[cfg(debug_assertions)]
    fn guard_mark_freed(&mut self, p: *mut u8) {
        let (g, i) = self.guard_locate(p);
        assert!(!g.free.contains(i), "double free detected for chunk {p:p}");
        g.free.set(i, true);
    }

    #[cfg(debug_assertions)]
    fn guard_untrack_block(&mut self, base: *mut u8) {
        let a = base.addr();
        if let Some(idx) = self.guards.iter().position(|g| g.base == a) {
            let g = self.guards.swap_remove(idx);
            assert!(
                g.free.count_ones(..) == g.free.len(),
                "released a block that still has allocated chunks",
            );
        }
    }
}

impl<A: RawAlloc> Drop for Pool<A> {
    fn drop(&mut self) {
        self.purge_memory();
    }
}

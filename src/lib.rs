//! Fixed-size-chunk suballocation: intrusive segregated free lists over a
//! doubling list of system blocks.
//!
//! The core type is [`Pool`], which serves chunks of one size class with
//! amortized O(1) alloc/free, optional address-ordered operation for
//! contiguous multi-chunk allocation and whole-block reclamation, and a
//! pluggable [`RawAlloc`] block source.  Layered on top:
//!
//! * [`ObjectPool`]: typed construct/destroy with leak finalization at
//!   teardown;
//! * [`GlobalPool`]: one mutex-guarded pool per [`PoolSpec`] key,
//!   process-wide;
//! * [`PoolAllocator`] / [`FastPoolAllocator`]: container-facing façades
//!   over the shared pools.

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod pool;

// core allocator
pub use pool::byte_pool::{Pool, DEFAULT_NEXT_SIZE};
pub use pool::free_list::FreeList;
pub use pool::user_alloc::{HeapAlloc, LibcAlloc, RawAlloc};

// façades
pub use pool::object_pool::{ConstructError, ObjectPool};
pub use pool::pool_alloc::{FastPoolAllocator, PoolAllocator, PoolError};
pub use pool::singleton::{GlobalPool, PoolSpec};

// diagnostics
pub use pool::stats::{snapshot, PoolStats};

// compile-time size arithmetic
pub use pool::math::{gcd, lcm};

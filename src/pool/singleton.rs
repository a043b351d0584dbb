//! Process-wide pools, one per configuration key.
//!
//! A [`GlobalPool`] is a cloneable handle to the single mutex-guarded
//! [`Pool`] registered for a [`PoolSpec`] and backend type.  The instance is
//! created on first touch; every operation holds the instance mutex for the
//! duration of the underlying pool call, so operations on one instance are
//! totally ordered.  No ordering exists across distinct instances.
//!
//! The registry mutex is held only during lookup, never during pool
//! operations, so independent pools do not contend with each other.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::ptr::NonNull;

use super::byte_pool::{Pool, DEFAULT_NEXT_SIZE};
use super::user_alloc::{HeapAlloc, RawAlloc};
use crate::sync::{Mutex, OnceLock};

// Handles are plain refcounts, not a synchronization point loom needs to
// explore; the std Arc keeps the registry usable in `static` context under
// both cfgs.
use std::sync::Arc;

/// Configuration key for a process-wide pool.
///
/// Two handles resolve to the same pool exactly when every field matches
/// (and they name the same backend type).  `id` exists to keep otherwise
/// identically-configured subsystems apart.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PoolSpec {
    /// Identity of the pool; distinct ids never share chunks.
    pub id: &'static str,
    /// Chunk size class served by the pool.
    pub requested_size: usize,
    /// Chunks requested on the first growth.
    pub next_size: usize,
    /// Cap on the doubling policy, in chunks; 0 means unbounded.
    pub max_size: usize,
}

impl PoolSpec {
    #[must_use]
    pub const fn new(id: &'static str, requested_size: usize) -> Self {
        Self {
            id,
            requested_size,
            next_size: DEFAULT_NEXT_SIZE,
            max_size: 0,
        }
    }

    #[must_use]
    pub const fn with_next_size(mut self, next_size: usize) -> Self {
        self.next_size = next_size;
        self
    }

    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }
}

#[derive(PartialEq, Eq, Hash)]
struct PoolKey {
    spec: PoolSpec,
    backend: TypeId,
}

type Registry = Mutex<HashMap<PoolKey, Arc<dyn Any + Send + Sync>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Cloneable handle to the process-wide pool for one [`PoolSpec`].
///
/// All methods lock the instance mutex; user-allocator callbacks running
/// under a pool operation must therefore never call back into the same
/// instance.
pub struct GlobalPool<A: RawAlloc + 'static = HeapAlloc> {
    inner: Arc<Mutex<Pool<A>>>,
}

impl<A: RawAlloc + 'static> Clone for GlobalPool<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: RawAlloc + 'static> GlobalPool<A> {
    /// Handle to the pool registered for `spec`, creating it on first
    /// touch.
    ///
    /// # Panics
    ///
    /// Panics if the registry mutex is poisoned, or on first touch if the
    /// spec is invalid (zero `requested_size` or `next_size`).
    #[must_use]
    pub fn instance(spec: PoolSpec) -> Self {
        let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        let entry = {
            let mut map = registry.lock().unwrap();
            let key = PoolKey {
                spec,
                backend: TypeId::of::<A>(),
            };
            map.entry(key)
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Pool::<A>::with_sizes(
                        spec.requested_size,
                        spec.next_size,
                        spec.max_size,
                    ))) as Arc<dyn Any + Send + Sync>
                })
                .clone()
        };
        let inner = entry
            .downcast::<Mutex<Pool<A>>>()
            .expect("registry entry matches the type its key names");
        Self { inner }
    }

    /// Allocate one chunk.  See [`Pool::alloc`].
    ///
    /// # Panics
    ///
    /// Panics if the instance mutex is poisoned (as do all other methods).
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        self.inner.lock().unwrap().alloc()
    }

    /// See [`Pool::ordered_alloc`].
    pub fn ordered_alloc(&self) -> Option<NonNull<u8>> {
        self.inner.lock().unwrap().ordered_alloc()
    }

    /// See [`Pool::ordered_alloc_n`].
    pub fn ordered_alloc_n(&self, n: usize) -> Option<NonNull<u8>> {
        self.inner.lock().unwrap().ordered_alloc_n(n)
    }

    /// See [`Pool::free`].
    ///
    /// # Safety
    ///
    /// `chunk` was returned by an alloc on this instance and is not already
    /// free.
    pub unsafe fn free(&self, chunk: NonNull<u8>) {
        // Safety: upheld by caller.
        unsafe { self.inner.lock().unwrap().free(chunk) };
    }

    /// See [`Pool::ordered_free`].
    ///
    /// # Safety
    ///
    /// As [`GlobalPool::free`], with the ordered discipline.
    pub unsafe fn ordered_free(&self, chunk: NonNull<u8>) {
        // Safety: upheld by caller.
        unsafe { self.inner.lock().unwrap().ordered_free(chunk) };
    }

    /// See [`Pool::free_n`].
    ///
    /// # Safety
    ///
    /// `chunks` was returned by [`GlobalPool::ordered_alloc_n`] on this
    /// instance with the same `n`, and no chunk of the range is already
    /// free.
    pub unsafe fn free_n(&self, chunks: NonNull<u8>, n: usize) {
        // Safety: upheld by caller.
        unsafe { self.inner.lock().unwrap().free_n(chunks, n) };
    }

    /// See [`Pool::ordered_free_n`].
    ///
    /// # Safety
    ///
    /// As [`GlobalPool::free_n`], with the ordered discipline.
    pub unsafe fn ordered_free_n(&self, chunks: NonNull<u8>, n: usize) {
        // Safety: upheld by caller.
        unsafe { self.inner.lock().unwrap().ordered_free_n(chunks, n) };
    }

    /// See [`Pool::is_from`].
    #[must_use]
    pub fn is_from(&self, chunk: NonNull<u8>) -> bool {
        self.inner.lock().unwrap().is_from(chunk)
    }

    /// See [`Pool::release_memory`].
    pub fn release_memory(&self) -> bool {
        self.inner.lock().unwrap().release_memory()
    }

    /// See [`Pool::purge_memory`].
    pub fn purge_memory(&self) -> bool {
        self.inner.lock().unwrap().purge_memory()
    }

    #[must_use]
    pub fn alloc_size(&self) -> usize {
        self.inner.lock().unwrap().alloc_size()
    }

    #[must_use]
    pub fn requested_size(&self) -> usize {
        self.inner.lock().unwrap().requested_size()
    }

    #[must_use]
    pub fn next_size(&self) -> usize {
        self.inner.lock().unwrap().next_size()
    }

    /// See [`Pool::set_next_size`].
    ///
    /// # Panics
    ///
    /// Panics if `next_size` is 0.
    pub fn set_next_size(&self, next_size: usize) {
        self.inner.lock().unwrap().set_next_size(next_size);
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.inner.lock().unwrap().max_size()
    }

    pub fn set_max_size(&self, max_size: usize) {
        self.inner.lock().unwrap().set_max_size(max_size);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::user_alloc::LibcAlloc;
    use crate::sync::thread;

    #[test]
    fn same_spec_resolves_to_one_instance() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let spec = PoolSpec::new("singleton-identity", 8).with_next_size(4);
        let h1 = GlobalPool::<HeapAlloc>::instance(spec);
        let h2 = GlobalPool::<HeapAlloc>::instance(spec);
        assert!(Arc::ptr_eq(&h1.inner, &h2.inner));

        let p = h1.alloc().expect("alloc failed");
        assert!(h2.is_from(p));
        // Safety: p came from this instance.
        unsafe { h2.free(p) };
        h1.purge_memory();
    }

    #[test]
    fn distinct_ids_get_distinct_pools() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let a = GlobalPool::<HeapAlloc>::instance(PoolSpec::new("singleton-id-a", 8));
        let b = GlobalPool::<HeapAlloc>::instance(PoolSpec::new("singleton-id-b", 8));
        assert!(!Arc::ptr_eq(&a.inner, &b.inner));

        let p = a.alloc().unwrap();
        assert!(!b.is_from(p));
        // Safety: p came from instance a.
        unsafe { a.free(p) };
        a.purge_memory();
        b.purge_memory();
    }

    #[test]
    fn distinct_sizes_get_distinct_pools() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let spec = PoolSpec::new("singleton-sized", 8);
        let a = GlobalPool::<HeapAlloc>::instance(spec);
        let b = GlobalPool::<HeapAlloc>::instance(PoolSpec {
            requested_size: 16,
            ..spec
        });
        assert!(!Arc::ptr_eq(&a.inner, &b.inner));
        assert_eq!(a.requested_size(), 8);
        assert_eq!(b.requested_size(), 16);
    }

    #[test]
    fn backends_do_not_share_pools() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let spec = PoolSpec::new("singleton-backend", 24).with_next_size(2);
        let heap = GlobalPool::<HeapAlloc>::instance(spec);
        let libc = GlobalPool::<LibcAlloc>::instance(spec);

        let p = heap.alloc().unwrap();
        let q = libc.alloc().unwrap();
        assert!(heap.is_from(p));
        assert!(libc.is_from(q));
        // Safety: each pointer goes back to its own instance.
        unsafe {
            heap.free(p);
            libc.free(q);
        }
        heap.purge_memory();
        libc.purge_memory();
    }

    #[test]
    fn spec_builders_feed_the_pool() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let spec = PoolSpec::new("singleton-config", 8)
            .with_next_size(4)
            .with_max_size(64);
        let h = GlobalPool::<HeapAlloc>::instance(spec);
        assert_eq!(h.next_size(), 4);
        assert_eq!(h.max_size(), 64);
        assert_eq!(h.alloc_size(), h.requested_size().max(8));
    }

    #[test]
    fn concurrent_allocs_hand_out_distinct_chunks() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let spec = PoolSpec::new("singleton-contention", 16).with_next_size(8);

        let handles: Vec<thread::JoinHandle<Vec<usize>>> = (0..4)
            .map(|_| {
                thread::spawn(move || {
                    let pool = GlobalPool::<HeapAlloc>::instance(spec);
                    let mut got = Vec::new();
                    for _ in 0..50 {
                        let p = pool.alloc().expect("alloc failed");
                        got.push(p.as_ptr().expose_provenance());
                    }
                    got
                })
            })
            .collect();

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "two threads observed the same chunk");

        let pool = GlobalPool::<HeapAlloc>::instance(spec);
        // Safety: every address came from this instance and is still live.
        unsafe {
            for addr in all {
                let p = std::ptr::with_exposed_provenance_mut::<u8>(addr);
                pool.free(NonNull::new(p).unwrap());
            }
        }
        pool.purge_memory();
    }
}

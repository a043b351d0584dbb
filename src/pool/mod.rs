pub(crate) mod block;
pub(crate) mod byte_pool;
pub(crate) mod free_list;
pub(crate) mod math;
pub(crate) mod object_pool;
pub(crate) mod pool_alloc;
pub(crate) mod singleton;
pub(crate) mod stats;
pub(crate) mod user_alloc;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}

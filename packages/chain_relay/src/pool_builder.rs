use crate::ObjectPool;

/// Builder for creating an instance of [`ObjectPool`].
///
/// This builder allows configuration of pool behavior before creation.
///
/// # Examples
///
/// ```
/// use chain_relay::ObjectPool;
///
/// // Default pool, idle lists grow without bound.
/// let pool = ObjectPool::builder().build();
///
/// // Keep at most 16 idle instances per type.
/// let pool = ObjectPool::builder().idle_limit(16).build();
/// ```
#[derive(Debug)]
#[must_use]
pub struct ObjectPoolBuilder {
    idle_limit: Option<usize>,
}

impl ObjectPoolBuilder {
    pub(crate) fn new() -> Self {
        Self { idle_limit: None }
    }

    /// Sets the maximum number of idle instances kept per type.
    ///
    /// When an instance becomes free while its type already has this many idle instances,
    /// the instance is dropped instead of being kept for reuse.
    pub fn idle_limit(mut self, limit: usize) -> Self {
        self.idle_limit = Some(limit);
        self
    }

    /// Builds the pool with the specified configuration.
    #[must_use]
    pub fn build(self) -> ObjectPool {
        ObjectPool::new_inner(self.idle_limit)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::Poolable;

    #[derive(Default)]
    struct Item;

    impl Poolable for Item {
        fn reset(&mut self) {}
    }

    #[test]
    fn default_has_no_idle_limit() {
        let pool = ObjectPool::builder().build();
        pool.register::<Item>();

        let items: Vec<_> = (0..5).map(|_| pool.allocate::<Item>().unwrap()).collect();
        for item in items {
            pool.free(item).unwrap();
        }

        assert_eq!(pool.idle_count::<Item>(), 5);
    }

    #[test]
    fn zero_idle_limit_disables_recycling() {
        let pool = ObjectPool::builder().idle_limit(0).build();
        pool.register::<Item>();

        let item = pool.allocate::<Item>().unwrap();
        pool.free(item).unwrap();
        let _again = pool.allocate::<Item>().unwrap();

        assert_eq!(pool.idle_count::<Item>(), 0);
        assert_eq!(pool.constructed_count::<Item>(), 2);
    }
}

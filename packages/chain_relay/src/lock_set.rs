use std::fmt;

use smallvec::SmallVec;

/// Opaque identity of an owner that keeps a pooled instance alive.
///
/// While any key is registered against an instance, the pool will not hand that instance
/// out again. The pool itself owns the [`LockKey::POOL`] key, which it applies on
/// allocation and removes on free. Other owners obtain their own keys from
/// [`ObjectPool::new_lock_key()`][crate::ObjectPool::new_lock_key].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct LockKey(u64);

impl LockKey {
    /// The key under which the pool marks an instance as checked out.
    pub const POOL: Self = Self(0);

    pub(crate) const fn from_raw(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock#{}", self.0)
    }
}

/// The set of owner keys currently registered against one outstanding instance.
///
/// Locking is idempotent per key and unlocking is order-independent. The common case of one
/// or two owners is stored inline without touching the heap.
#[derive(Debug, Default)]
pub(crate) struct LockSet {
    keys: SmallVec<[LockKey; 4]>,
}

impl LockSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&mut self, key: LockKey) {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    /// Removes the key, returning whether it was held.
    pub(crate) fn unlock(&mut self, key: LockKey) -> bool {
        match self.keys.iter().position(|k| *k == key) {
            Some(index) => {
                self.keys.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        !self.keys.is_empty()
    }

    pub(crate) fn is_held_by(&self, key: LockKey) -> bool {
        self.keys.contains(&key)
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}

use std::any::{Any, type_name};
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::ptr;
use std::rc::Rc;

use crate::{Poolable, TypeKey};

/// Identity of one instance constructed by an [`ObjectPool`][crate::ObjectPool].
///
/// The identity is stable for the lifetime of the instance, across any number of
/// allocate/free cycles.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) const fn from_raw(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which allocation of an instance a handle was issued for.
///
/// The generation advances every time the instance goes back to the idle list, which lets
/// the pool recognize handles that outlived their allocation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Slot {
    pub(crate) instance: InstanceId,
    pub(crate) generation: u64,
}

/// A handle to an instance checked out of an [`ObjectPool`][crate::ObjectPool].
///
/// Cloning the handle is cheap and yields another handle to the same instance. Handles do not
/// keep an instance checked out by themselves: that is governed entirely by the locks held in
/// the pool. Return the allocation with [`ObjectPool::free()`][crate::ObjectPool::free] when
/// done.
///
/// # Single-threaded design
///
/// This type is neither [`Send`] nor [`Sync`].
///
/// # Example
///
/// ```
/// use chain_relay::{ObjectPool, Poolable};
///
/// #[derive(Default)]
/// struct Counter(u32);
///
/// impl Poolable for Counter {
///     fn reset(&mut self) {
///         self.0 = 0;
///     }
/// }
///
/// let pool = ObjectPool::new();
/// pool.register::<Counter>();
///
/// let counter = pool.allocate::<Counter>().unwrap();
/// counter.borrow_mut().0 += 1;
/// assert_eq!(counter.borrow().0, 1);
///
/// pool.free(counter).unwrap();
/// ```
pub struct Pooled<T> {
    slot: Slot,
    value: Rc<RefCell<T>>,
}

impl<T: Poolable> Pooled<T> {
    pub(crate) fn new(slot: Slot, value: Rc<RefCell<T>>) -> Self {
        Self { slot, value }
    }

    /// Immutably borrows the pooled value.
    ///
    /// # Panics
    ///
    /// Panics if the value is currently mutably borrowed.
    #[must_use]
    pub fn borrow(&self) -> Ref<'_, T> {
        self.value.borrow()
    }

    /// Mutably borrows the pooled value.
    ///
    /// # Panics
    ///
    /// Panics if the value is currently borrowed.
    #[must_use]
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.value.borrow_mut()
    }

    /// Whether both handles refer to the same storage, regardless of allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.value, &other.value)
    }

    /// The identity of the underlying instance.
    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.slot.instance
    }

    /// Returns a type-erased handle to the same allocation.
    #[must_use]
    pub fn erase(&self) -> ErasedPooled {
        ErasedPooled {
            slot: self.slot,
            type_key: TypeKey::of::<T>(),
            value: Rc::<RefCell<T>>::clone(&self.value),
        }
    }

    pub(crate) fn slot(&self) -> Slot {
        self.slot
    }

    pub(crate) fn cell(&self) -> &Rc<RefCell<T>> {
        &self.value
    }

    /// Address of the shared storage, comparable across typed and erased handles.
    pub(crate) fn storage(&self) -> *const () {
        Rc::as_ptr(&self.value).cast()
    }
}

impl<T> Clone for Pooled<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot,
            value: Rc::clone(&self.value),
        }
    }
}

impl<T> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// A type-erased handle to an instance checked out of an [`ObjectPool`][crate::ObjectPool].
///
/// Obtained from [`Pooled::erase()`] or [`ObjectPool::allocate_erased()`][1]. Wildcard event
/// listeners receive events in this form.
///
/// [1]: crate::ObjectPool::allocate_erased
#[derive(Clone)]
pub struct ErasedPooled {
    slot: Slot,
    type_key: TypeKey,
    value: Rc<dyn Any>,
}

impl ErasedPooled {
    pub(crate) fn new(slot: Slot, type_key: TypeKey, value: Rc<dyn Any>) -> Self {
        Self {
            slot,
            type_key,
            value,
        }
    }

    /// The type of the pooled value.
    #[must_use]
    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    /// Whether the pooled value is of type `T`.
    #[must_use]
    pub fn is<T: Poolable>(&self) -> bool {
        self.value.is::<RefCell<T>>()
    }

    /// Recovers the typed handle, if the pooled value is of type `T`.
    #[must_use]
    pub fn downcast<T: Poolable>(&self) -> Option<Pooled<T>> {
        Rc::clone(&self.value)
            .downcast::<RefCell<T>>()
            .ok()
            .map(|value| Pooled::new(self.slot, value))
    }

    /// Whether both handles refer to the same storage, regardless of allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        ptr::addr_eq(Rc::as_ptr(&self.value), Rc::as_ptr(&other.value))
    }

    /// The identity of the underlying instance.
    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.slot.instance
    }

    pub(crate) fn slot(&self) -> Slot {
        self.slot
    }

    pub(crate) fn storage(&self) -> *const () {
        Rc::as_ptr(&self.value).cast()
    }

    /// Borrows the typed cell without cloning the handle.
    pub(crate) fn cell<T: Poolable>(&self) -> Option<&RefCell<T>> {
        self.value.downcast_ref::<RefCell<T>>()
    }
}

impl fmt::Debug for ErasedPooled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("slot", &self.slot)
            .field("type_key", &self.type_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_not_impl_any;

    use super::*;

    assert_not_impl_any!(Pooled<u32>: Send, Sync);
    assert_not_impl_any!(ErasedPooled: Send, Sync);

    struct Sample(u32);

    impl Poolable for Sample {
        fn reset(&mut self) {
            self.0 = 0;
        }
    }

    struct Other;

    impl Poolable for Other {
        fn reset(&mut self) {}
    }

    fn sample(value: u32) -> Pooled<Sample> {
        let slot = Slot {
            instance: InstanceId::from_raw(7),
            generation: 0,
        };

        Pooled::new(slot, Rc::new(RefCell::new(Sample(value))))
    }

    #[test]
    fn clones_share_storage() {
        let first = sample(5);
        let second = first.clone();

        second.borrow_mut().0 = 9;

        assert!(first.ptr_eq(&second));
        assert_eq!(first.borrow().0, 9);
    }

    #[test]
    fn erase_then_downcast_recovers_same_instance() {
        let typed = sample(3);
        let erased = typed.erase();

        assert!(erased.is::<Sample>());
        assert!(!erased.is::<Other>());
        assert_eq!(erased.type_key(), TypeKey::of::<Sample>());
        assert_eq!(erased.instance_id(), typed.instance_id());

        let recovered = erased.downcast::<Sample>().unwrap();
        assert!(recovered.ptr_eq(&typed));
        assert!(erased.downcast::<Other>().is_none());
    }

    #[test]
    fn erased_ptr_eq_compares_storage() {
        let first = sample(1);
        let second = sample(1);

        assert!(first.erase().ptr_eq(&first.erase()));
        assert!(!first.erase().ptr_eq(&second.erase()));
    }

    #[test]
    fn storage_matches_between_typed_and_erased_handles() {
        let first = sample(1);
        let second = sample(1);

        assert_eq!(first.storage(), first.erase().storage());
        assert_ne!(first.storage(), second.erase().storage());
    }

    #[test]
    fn cell_borrows_typed_value() {
        let erased = sample(11).erase();

        assert_eq!(erased.cell::<Sample>().unwrap().borrow().0, 11);
        assert!(erased.cell::<Other>().is_none());
    }
}

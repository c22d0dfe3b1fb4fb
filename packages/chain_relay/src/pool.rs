use std::any::{Any, TypeId, type_name};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::ptr;
use std::rc::Rc;

use foldhash::{HashMap, HashMapExt};
use tracing::{trace, warn};

use crate::{
    Error, ErasedPooled, InstanceId, LockKey, LockSet, ObjectPoolBuilder, Poolable, Pooled,
    Result, Slot, TypeKey, metrics,
};

/// A type-keyed recycling store for resettable instances, with multi-owner locks that govern
/// when an instance becomes eligible for reuse.
///
/// Every instance the pool constructs stays owned by the pool. Callers check instances out
/// with [`allocate()`][Self::allocate] and return them with [`free()`][Self::free]. Between
/// those two calls the instance carries an implicit lock under [`LockKey::POOL`].
///
/// Any other owner may add its own lock with [`lock()`][Self::lock] to keep an instance out of
/// circulation after it has been freed. The instance only returns to the idle list once its
/// lock set is empty, which may happen in [`unlock()`][Self::unlock] long after the matching
/// `free()` call.
///
/// This type acts as a cloneable handle to shared pool state. All clones refer to the same
/// pool.
///
/// # Registration
///
/// Types must be registered before they can be allocated. Registration stores a factory
/// closure together with the reset hook of the type, so no reflection or default constructor
/// is needed at allocation time.
///
/// # Example
///
/// ```
/// use chain_relay::{ObjectPool, Poolable};
///
/// #[derive(Default)]
/// struct Message {
///     text: String,
/// }
///
/// impl Poolable for Message {
///     fn reset(&mut self) {
///         self.text.clear();
///     }
/// }
///
/// let pool = ObjectPool::new();
/// pool.register::<Message>();
///
/// let first = pool.allocate::<Message>().unwrap();
/// first.borrow_mut().text.push_str("hello");
/// pool.free(first.clone()).unwrap();
///
/// // The freed instance is reused, blank again.
/// let second = pool.allocate::<Message>().unwrap();
/// assert!(second.ptr_eq(&first));
/// assert!(second.borrow().text.is_empty());
/// assert_eq!(pool.constructed_count::<Message>(), 1);
/// ```
///
/// # Single-threaded design
///
/// This type is neither [`Send`] nor [`Sync`]. Reentrant use from within reset hooks or from
/// code running while the pool is mid-operation is supported, because the pool never invokes
/// user code while its own state is borrowed.
#[derive(Clone)]
pub struct ObjectPool {
    inner: Rc<RefCell<PoolState>>,
}

type Factory = Rc<dyn Fn() -> Rc<dyn Any>>;

struct TypeEntry {
    key: TypeKey,
    factory: Factory,
    reset: fn(&dyn Any),

    /// Instances ready for reuse, in the order they became free.
    idle: VecDeque<IdleInstance>,

    /// Count of distinct instances ever constructed for this type.
    constructed: usize,
}

struct IdleInstance {
    slot: Slot,
    value: Rc<dyn Any>,
}

struct Outstanding {
    type_key: TypeKey,
    generation: u64,
    locks: LockSet,
    value: Rc<dyn Any>,
}

impl Outstanding {
    /// Whether a handle with this slot and storage refers to this allocation.
    ///
    /// Instance ids are only unique within one pool, so the storage address tells apart
    /// handles issued by other pools.
    fn matches(&self, slot: Slot, storage: *const ()) -> bool {
        self.generation == slot.generation && ptr::eq(Rc::as_ptr(&self.value).cast(), storage)
    }
}

struct PoolState {
    types: HashMap<TypeId, TypeEntry>,
    outstanding: HashMap<InstanceId, Outstanding>,
    next_instance: u64,
    next_lock_key: u64,
    idle_limit: Option<usize>,
}

/// How the allocation of an instance is satisfied.
enum Source {
    Idle(IdleInstance),
    Construct(Factory, InstanceId),
}

impl ObjectPool {
    /// Creates a new pool with default configuration.
    ///
    /// For custom configuration, use [`ObjectPool::builder()`].
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring and constructing an [`ObjectPool`].
    ///
    /// # Example
    ///
    /// ```
    /// use chain_relay::ObjectPool;
    ///
    /// let pool = ObjectPool::builder().idle_limit(64).build();
    /// ```
    #[cfg_attr(test, mutants::skip)] // Gets replaced with itself by different name, bad mutation.
    pub fn builder() -> ObjectPoolBuilder {
        ObjectPoolBuilder::new()
    }

    pub(crate) fn new_inner(idle_limit: Option<usize>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(PoolState {
                types: HashMap::new(),
                outstanding: HashMap::new(),
                next_instance: 0,
                // Zero is reserved for the pool's own key.
                next_lock_key: 1,
                idle_limit,
            })),
        }
    }

    /// Registers `T`, constructing new instances via [`Default`].
    ///
    /// Registering a type again replaces its factory but keeps its idle instances and
    /// counters.
    pub fn register<T>(&self)
    where
        T: Poolable + Default,
    {
        self.register_with(T::default);
    }

    /// Registers `T`, constructing new instances via `factory`.
    ///
    /// Registering a type again replaces its factory but keeps its idle instances and
    /// counters.
    ///
    /// # Example
    ///
    /// ```
    /// use chain_relay::{ObjectPool, Poolable};
    ///
    /// struct Buffer {
    ///     bytes: Vec<u8>,
    /// }
    ///
    /// impl Poolable for Buffer {
    ///     fn reset(&mut self) {
    ///         self.bytes.clear();
    ///     }
    /// }
    ///
    /// let pool = ObjectPool::new();
    /// pool.register_with(|| Buffer {
    ///     bytes: Vec::with_capacity(4096),
    /// });
    ///
    /// let buffer = pool.allocate::<Buffer>().unwrap();
    /// assert!(buffer.borrow().bytes.capacity() >= 4096);
    /// ```
    pub fn register_with<T, F>(&self, factory: F)
    where
        T: Poolable,
        F: Fn() -> T + 'static,
    {
        let factory: Factory = Rc::new(move || -> Rc<dyn Any> { Rc::new(RefCell::new(factory())) });

        let mut state = self.inner.borrow_mut();
        let key = TypeKey::of::<T>();

        match state.types.get_mut(&key.id()) {
            Some(entry) => entry.factory = factory,
            None => {
                state.types.insert(
                    key.id(),
                    TypeEntry {
                        key,
                        factory,
                        reset: reset_erased::<T>,
                        idle: VecDeque::new(),
                        constructed: 0,
                    },
                );
            }
        }
    }

    /// Registers `T` via `factory` unless it is already registered.
    pub(crate) fn ensure_registered_with<T, F>(&self, factory: F)
    where
        T: Poolable,
        F: Fn() -> T + 'static,
    {
        if !self.is_registered::<T>() {
            self.register_with(factory);
        }
    }

    /// Whether `T` has been registered with this pool.
    #[must_use]
    pub fn is_registered<T: Poolable>(&self) -> bool {
        self.is_registered_key(TypeKey::of::<T>())
    }

    /// Whether the type identified by `type_key` has been registered with this pool.
    #[must_use]
    pub fn is_registered_key(&self, type_key: TypeKey) -> bool {
        self.inner.borrow().types.contains_key(&type_key.id())
    }

    /// Checks out an instance of `T`, reusing an idle one if available.
    ///
    /// The instance is reset before it is returned and carries the implicit pool lock until it
    /// is returned via [`free()`][Self::free].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidType`] if `T` has not been registered.
    pub fn allocate<T: Poolable>(&self) -> Result<Pooled<T>> {
        let erased = self.allocate_erased(TypeKey::of::<T>())?;

        erased.downcast::<T>().ok_or(Error::MismatchedType {
            expected: type_name::<T>(),
            actual: erased.type_key().name(),
        })
    }

    /// Checks out an instance of the type identified by `type_key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidType`] if the type has not been registered.
    pub fn allocate_erased(&self, type_key: TypeKey) -> Result<ErasedPooled> {
        let (source, reset) = {
            let mut state = self.inner.borrow_mut();
            let instance = InstanceId::from_raw(state.next_instance);

            let entry = state
                .types
                .get_mut(&type_key.id())
                .ok_or(Error::InvalidType {
                    type_name: type_key.name(),
                })?;

            let source = match entry.idle.pop_front() {
                Some(idle) => Source::Idle(idle),
                None => {
                    entry.constructed = entry.constructed.wrapping_add(1);
                    Source::Construct(Rc::clone(&entry.factory), instance)
                }
            };

            let reset = entry.reset;

            if matches!(source, Source::Construct(..)) {
                state.next_instance = state.next_instance.wrapping_add(1);
            }

            (source, reset)
        };

        // User code (factory and reset hook) runs without the pool state borrowed.
        let (slot, value) = match source {
            Source::Idle(idle) => {
                metrics::POOL_REUSED.with(nm::Event::observe_once);
                (idle.slot, idle.value)
            }
            Source::Construct(factory, instance) => {
                metrics::POOL_CONSTRUCTED.with(nm::Event::observe_once);
                trace!(pooled_type = type_key.name(), %instance, "constructed pooled instance");

                let slot = Slot {
                    instance,
                    generation: 0,
                };

                (slot, factory())
            }
        };

        reset(&*value);

        let mut locks = LockSet::new();
        locks.lock(LockKey::POOL);

        self.inner.borrow_mut().outstanding.insert(
            slot.instance,
            Outstanding {
                type_key,
                generation: slot.generation,
                locks,
                value: Rc::clone(&value),
            },
        );

        Ok(ErasedPooled::new(slot, type_key, value))
    }

    /// Removes the implicit pool lock from an allocation of `T`.
    ///
    /// The instance becomes available for reuse once no other locks remain on it. Freeing a
    /// handle whose allocation has already ended, or that was issued by another pool, is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidType`] if `T` has not been registered with this pool.
    pub fn free<T: Poolable>(&self, instance: Pooled<T>) -> Result<()> {
        self.unlock(&instance, LockKey::POOL)
    }

    /// Removes the implicit pool lock from a type-erased allocation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NullInstance`] if `instance` is `None`, [`Error::InvalidType`] if
    /// the declared type has not been registered and [`Error::MismatchedType`] if the
    /// instance is not of the declared type.
    pub fn free_erased(&self, type_key: TypeKey, instance: Option<&ErasedPooled>) -> Result<()> {
        self.unlock_erased(type_key, instance, LockKey::POOL)
    }

    /// Adds a lock owned by `key` to an outstanding allocation of `T`.
    ///
    /// Locking is idempotent per key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidType`] if `T` has not been registered with this pool and
    /// [`Error::StaleInstance`] if the allocation the handle refers to has already ended or
    /// belongs to another pool.
    pub fn lock<T: Poolable>(&self, instance: &Pooled<T>, key: LockKey) -> Result<()> {
        let type_key = TypeKey::of::<T>();
        self.validate_registered(type_key)?;
        self.lock_slot(type_key, instance.slot(), instance.storage(), key)
    }

    /// Adds a lock owned by `key` to an outstanding type-erased allocation.
    ///
    /// # Errors
    ///
    /// Returns the same validation errors as [`free_erased()`][Self::free_erased], plus
    /// [`Error::StaleInstance`] if the allocation the handle refers to has already ended.
    pub fn lock_erased(
        &self,
        type_key: TypeKey,
        instance: Option<&ErasedPooled>,
        key: LockKey,
    ) -> Result<()> {
        let instance = self.validate_erased(type_key, instance)?;
        self.lock_slot(type_key, instance.slot(), instance.storage(), key)
    }

    /// Removes the lock owned by `key` from an allocation of `T`.
    ///
    /// Unlocking a key that is not held is a no-op. If this removes the last lock, the
    /// instance returns to the idle list of its type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidType`] if `T` has not been registered with this pool.
    pub fn unlock<T: Poolable>(&self, instance: &Pooled<T>, key: LockKey) -> Result<()> {
        self.validate_registered(TypeKey::of::<T>())?;
        self.unlock_slot(instance.slot(), instance.storage(), key);
        Ok(())
    }

    /// Removes the lock owned by `key` from a type-erased allocation.
    ///
    /// # Errors
    ///
    /// Returns the same validation errors as [`free_erased()`][Self::free_erased].
    pub fn unlock_erased(
        &self,
        type_key: TypeKey,
        instance: Option<&ErasedPooled>,
        key: LockKey,
    ) -> Result<()> {
        let instance = self.validate_erased(type_key, instance)?;
        self.unlock_slot(instance.slot(), instance.storage(), key);
        Ok(())
    }

    /// Mints a new owner key, distinct from every key minted before by this pool and from
    /// [`LockKey::POOL`].
    #[must_use]
    pub fn new_lock_key(&self) -> LockKey {
        let mut state = self.inner.borrow_mut();
        let key = LockKey::from_raw(state.next_lock_key);
        state.next_lock_key = state.next_lock_key.wrapping_add(1);
        key
    }

    /// Constructs `count` new instances of `T` straight into the idle list, so that later
    /// allocations do not need to construct anything.
    ///
    /// Instances that are already idle are left alone and do not count toward `count`.
    /// Construction stops early once the idle list of `T` reaches the configured idle limit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidType`] if `T` has not been registered.
    pub fn prewarm<T: Poolable>(&self, count: usize) -> Result<()> {
        let type_key = TypeKey::of::<T>();
        self.validate_registered(type_key)?;

        for _ in 0..count {
            let (factory, instance) = {
                let mut state = self.inner.borrow_mut();
                let idle_limit = state.idle_limit;
                let instance = InstanceId::from_raw(state.next_instance);

                let entry = state
                    .types
                    .get_mut(&type_key.id())
                    .ok_or(Error::InvalidType {
                        type_name: type_key.name(),
                    })?;

                if idle_limit.is_some_and(|limit| entry.idle.len() >= limit) {
                    break;
                }

                entry.constructed = entry.constructed.wrapping_add(1);
                let factory = Rc::clone(&entry.factory);

                state.next_instance = state.next_instance.wrapping_add(1);
                (factory, instance)
            };

            metrics::POOL_CONSTRUCTED.with(nm::Event::observe_once);
            trace!(pooled_type = type_key.name(), %instance, "prewarmed pooled instance");

            // The factory is user code and runs without the pool state borrowed.
            let value = factory();

            let mut state = self.inner.borrow_mut();
            if let Some(entry) = state.types.get_mut(&type_key.id()) {
                entry.idle.push_back(IdleInstance {
                    slot: Slot {
                        instance,
                        generation: 0,
                    },
                    value,
                });
            }
        }

        Ok(())
    }

    /// Count of distinct instances of `T` ever constructed by this pool.
    ///
    /// Reuse of an idle instance does not increase this count.
    #[must_use]
    pub fn constructed_count<T: Poolable>(&self) -> usize {
        self.constructed_count_of(TypeKey::of::<T>())
    }

    /// Count of distinct instances of the identified type ever constructed by this pool.
    #[must_use]
    pub fn constructed_count_of(&self, type_key: TypeKey) -> usize {
        self.inner
            .borrow()
            .types
            .get(&type_key.id())
            .map_or(0, |entry| entry.constructed)
    }

    /// Count of instances of `T` currently waiting for reuse.
    #[must_use]
    pub fn idle_count<T: Poolable>(&self) -> usize {
        self.inner
            .borrow()
            .types
            .get(&TypeId::of::<T>())
            .map_or(0, |entry| entry.idle.len())
    }

    /// Count of instances of any type that currently hold at least one lock.
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        self.inner.borrow().outstanding.len()
    }

    /// Whether the allocation the handle refers to still holds any lock.
    #[must_use]
    pub fn is_locked<T: Poolable>(&self, instance: &Pooled<T>) -> bool {
        self.lock_count(instance) > 0
    }

    /// Whether the allocation the handle refers to holds the lock owned by `key`.
    #[must_use]
    pub fn is_locked_by<T: Poolable>(&self, instance: &Pooled<T>, key: LockKey) -> bool {
        self.with_outstanding(instance.slot(), instance.storage(), |outstanding| {
            outstanding.locks.is_held_by(key)
        })
        .unwrap_or(false)
    }

    /// Count of distinct owners holding a lock on the allocation the handle refers to.
    #[must_use]
    pub fn lock_count<T: Poolable>(&self, instance: &Pooled<T>) -> usize {
        self.with_outstanding(instance.slot(), instance.storage(), |outstanding| {
            outstanding.locks.len()
        })
            .unwrap_or(0)
    }

    fn with_outstanding<R>(
        &self,
        slot: Slot,
        storage: *const (),
        f: impl FnOnce(&Outstanding) -> R,
    ) -> Option<R> {
        let state = self.inner.borrow();

        state
            .outstanding
            .get(&slot.instance)
            .filter(|outstanding| outstanding.matches(slot, storage))
            .map(f)
    }

    fn validate_registered(&self, type_key: TypeKey) -> Result<()> {
        if self.is_registered_key(type_key) {
            Ok(())
        } else {
            Err(Error::InvalidType {
                type_name: type_key.name(),
            })
        }
    }

    fn validate_erased<'a>(
        &self,
        type_key: TypeKey,
        instance: Option<&'a ErasedPooled>,
    ) -> Result<&'a ErasedPooled> {
        let instance = instance.ok_or(Error::NullInstance {
            type_name: type_key.name(),
        })?;

        self.validate_registered(type_key)?;

        if instance.type_key() != type_key {
            return Err(Error::MismatchedType {
                expected: type_key.name(),
                actual: instance.type_key().name(),
            });
        }

        Ok(instance)
    }

    fn lock_slot(
        &self,
        type_key: TypeKey,
        slot: Slot,
        storage: *const (),
        key: LockKey,
    ) -> Result<()> {
        let mut state = self.inner.borrow_mut();

        match state.outstanding.get_mut(&slot.instance) {
            Some(outstanding) if outstanding.matches(slot, storage) => {
                outstanding.locks.lock(key);
                Ok(())
            }
            _ => Err(Error::StaleInstance {
                type_name: type_key.name(),
                instance: slot.instance,
            }),
        }
    }

    fn unlock_slot(&self, slot: Slot, storage: *const (), key: LockKey) {
        let dropped = {
            let mut state = self.inner.borrow_mut();
            let idle_limit = state.idle_limit;

            let Some(outstanding) = state.outstanding.get_mut(&slot.instance) else {
                trace!(instance = %slot.instance, %key, "unlock of instance that is not outstanding");
                return;
            };

            if !outstanding.matches(slot, storage) {
                warn!(
                    pooled_type = outstanding.type_key.name(),
                    instance = %slot.instance,
                    %key,
                    "ignoring unlock through a handle from an earlier allocation or another pool"
                );
                return;
            }

            outstanding.locks.unlock(key);

            if outstanding.locks.is_locked() {
                return;
            }

            let Some(outstanding) = state.outstanding.remove(&slot.instance) else {
                return;
            };

            let Some(entry) = state.types.get_mut(&outstanding.type_key.id()) else {
                return;
            };

            if idle_limit.is_some_and(|limit| entry.idle.len() >= limit) {
                trace!(
                    pooled_type = entry.key.name(),
                    instance = %slot.instance,
                    "idle limit reached, discarding instance"
                );
                Some(outstanding.value)
            } else {
                entry.idle.push_back(IdleInstance {
                    slot: Slot {
                        instance: slot.instance,
                        generation: outstanding.generation.wrapping_add(1),
                    },
                    value: outstanding.value,
                });
                None
            }
        };

        // Dropping the value may run user code, so it happens after the state borrow ends.
        drop(dropped);
    }
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();

        f.debug_struct(type_name::<Self>())
            .field("types", &state.types.len())
            .field("outstanding", &state.outstanding.len())
            .field("idle_limit", &state.idle_limit)
            .finish_non_exhaustive()
    }
}

fn reset_erased<T: Poolable>(value: &dyn Any) {
    if let Some(cell) = value.downcast_ref::<RefCell<T>>() {
        cell.borrow_mut().reset();
    }
}

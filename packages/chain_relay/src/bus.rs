use std::any::{Any, TypeId, type_name};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use foldhash::{HashMap, HashMapExt};
use smallvec::SmallVec;
use tracing::trace;

use crate::{ErasedPooled, ListenerList, ObjectPool, Poolable, Pooled, Result, metrics};

/// Identity of a listener registered with an [`EventBus`].
///
/// Returned by every subscribe call and used to unsubscribe the listener again.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) const fn from_raw(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

type TypedListener<E> = dyn Fn(&Pooled<E>);
type WildcardListener = dyn Fn(&ErasedPooled);

/// A typed publish/subscribe dispatcher whose events are pooled instances.
///
/// Publishing an event allocates it from the [`ObjectPool`] the bus was created with, lets
/// the caller populate it, hands it synchronously to every matching listener and then frees
/// it back to the pool. A listener that needs the event to outlive the dispatch must lock it
/// in the pool with its own [`LockKey`][crate::LockKey]. Events nobody locked are reset
/// before they go back to the pool.
///
/// Listeners are invoked in three groups, each in registration order:
///
/// 1. Persistent listeners of the event type.
/// 2. One-shot listeners of the event type, which are removed as part of this dispatch.
/// 3. Wildcard listeners, which receive every event in type-erased form.
///
/// # Reentrancy
///
/// Listeners may subscribe, unsubscribe (including themselves) and publish from inside a
/// dispatch. Every listener registered when a dispatch starts is invoked exactly once by that
/// dispatch, and registry changes made during the dispatch take effect from the next one.
///
/// # Example
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// use chain_relay::{EventBus, ObjectPool, Poolable};
///
/// #[derive(Default)]
/// struct Tick {
///     count: u32,
/// }
///
/// impl Poolable for Tick {
///     fn reset(&mut self) {
///         self.count = 0;
///     }
/// }
///
/// let pool = ObjectPool::new();
/// pool.register::<Tick>();
/// let bus = EventBus::new(pool);
///
/// let seen = Rc::new(Cell::new(0));
/// bus.subscribe::<Tick, _>({
///     let seen = Rc::clone(&seen);
///     move |tick| seen.set(tick.borrow().count)
/// });
///
/// bus.publish_with::<Tick>(|tick| tick.count = 7).unwrap();
/// assert_eq!(seen.get(), 7);
/// ```
///
/// # Single-threaded design
///
/// This type is a cloneable handle to shared state and is neither [`Send`] nor [`Sync`].
#[derive(Clone)]
pub struct EventBus {
    inner: Rc<BusCore>,
}

struct BusCore {
    pool: ObjectPool,
    registry: RefCell<BusRegistry>,
}

struct BusRegistry {
    /// `TypedListeners<E>` keyed by the type id of `E`.
    typed: HashMap<TypeId, Box<dyn Any>>,
    wildcard: ListenerList<WildcardListener>,
    next_id: u64,
}

struct TypedListeners<E: Poolable> {
    persistent: ListenerList<TypedListener<E>>,
    once: ListenerList<TypedListener<E>>,
}

impl<E: Poolable> TypedListeners<E> {
    fn new() -> Self {
        Self {
            persistent: ListenerList::new(),
            once: ListenerList::new(),
        }
    }
}

impl BusRegistry {
    fn next_id(&mut self) -> ListenerId {
        let id = ListenerId::from_raw(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn typed<E: Poolable>(&self) -> Option<&TypedListeners<E>> {
        self.typed
            .get(&TypeId::of::<E>())
            .and_then(|listeners| listeners.downcast_ref())
    }

    fn typed_mut<E: Poolable>(&mut self) -> Option<&mut TypedListeners<E>> {
        self.typed
            .get_mut(&TypeId::of::<E>())
            .and_then(|listeners| listeners.downcast_mut())
    }

    fn update_typed<E: Poolable>(&mut self, f: impl FnOnce(&mut TypedListeners<E>)) {
        if let Some(listeners) = self.typed_mut::<E>() {
            f(listeners);
            return;
        }

        let mut listeners = TypedListeners::<E>::new();
        f(&mut listeners);
        self.typed.insert(TypeId::of::<E>(), Box::new(listeners));
    }
}

impl EventBus {
    /// Creates a bus that allocates its events from `pool`.
    #[must_use]
    pub fn new(pool: ObjectPool) -> Self {
        Self {
            inner: Rc::new(BusCore {
                pool,
                registry: RefCell::new(BusRegistry {
                    typed: HashMap::new(),
                    wildcard: ListenerList::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    /// The pool events are allocated from.
    #[must_use]
    pub fn pool(&self) -> &ObjectPool {
        &self.inner.pool
    }

    /// Registers a listener invoked on every publish of `E`.
    pub fn subscribe<E, F>(&self, listener: F) -> ListenerId
    where
        E: Poolable,
        F: Fn(&Pooled<E>) + 'static,
    {
        let mut registry = self.inner.registry.borrow_mut();
        let id = registry.next_id();
        registry.update_typed::<E>(|listeners| listeners.persistent.push(id, Rc::new(listener)));
        id
    }

    /// Registers a listener invoked only on the next publish of `E`.
    ///
    /// A one-shot listener registered during a dispatch of `E` is not part of that dispatch;
    /// it fires on the publish after it.
    pub fn subscribe_once<E, F>(&self, listener: F) -> ListenerId
    where
        E: Poolable,
        F: Fn(&Pooled<E>) + 'static,
    {
        let mut registry = self.inner.registry.borrow_mut();
        let id = registry.next_id();
        registry.update_typed::<E>(|listeners| listeners.once.push(id, Rc::new(listener)));
        id
    }

    /// Registers a listener invoked on every publish of any event type.
    pub fn subscribe_all<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ErasedPooled) + 'static,
    {
        let mut registry = self.inner.registry.borrow_mut();
        let id = registry.next_id();
        registry.wildcard.push(id, Rc::new(listener));
        id
    }

    /// Removes a listener from the persistent and one-shot listeners of `E` and from the
    /// wildcard listeners.
    ///
    /// Returns whether any listener was removed. Removing a listener from inside a dispatch
    /// does not affect that dispatch.
    pub fn unsubscribe<E: Poolable>(&self, id: ListenerId) -> bool {
        let mut registry = self.inner.registry.borrow_mut();

        let mut removed = registry.wildcard.remove(id);

        if let Some(listeners) = registry.typed_mut::<E>() {
            let persistent = listeners.persistent.remove(id);
            let once = listeners.once.remove(id);
            removed = removed || persistent || once;
        }

        removed
    }

    /// Removes a wildcard listener, returning whether it was registered.
    pub fn unsubscribe_wildcard(&self, id: ListenerId) -> bool {
        self.inner.registry.borrow_mut().wildcard.remove(id)
    }

    /// Publishes a blank event of type `E`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidType`][crate::Error::InvalidType] if `E` is not registered with
    /// the pool.
    pub fn publish<E: Poolable>(&self) -> Result<()> {
        self.publish_with::<E>(|_| {})
    }

    /// Publishes an event of type `E`, populated by `initializer` before dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidType`][crate::Error::InvalidType] if `E` is not registered with
    /// the pool.
    pub fn publish_with<E: Poolable>(&self, initializer: impl FnOnce(&mut E)) -> Result<()> {
        let event = self.inner.pool.allocate::<E>()?;

        initializer(&mut *event.borrow_mut());

        self.dispatch(&event);

        // Clear the payload unless a listener kept the event, so idle events hold no handles.
        if self.inner.pool.lock_count(&event) == 1 {
            event.borrow_mut().reset();
        }

        self.inner.pool.free(event)
    }

    fn dispatch<E: Poolable>(&self, event: &Pooled<E>) {
        metrics::EVENTS_PUBLISHED.with(nm::Event::observe_once);

        let (persistent, once, wildcard) = {
            let mut registry = self.inner.registry.borrow_mut();
            let wildcard = registry.wildcard.snapshot();

            match registry.typed_mut::<E>() {
                Some(listeners) => (
                    listeners.persistent.snapshot(),
                    listeners.once.take_snapshot(),
                    wildcard,
                ),
                None => (SmallVec::new(), SmallVec::new(), wildcard),
            }
        };

        trace!(
            event_type = type_name::<E>(),
            instance = %event.instance_id(),
            persistent = persistent.len(),
            once = once.len(),
            wildcard = wildcard.len(),
            "dispatching event"
        );

        for listener in persistent.iter().chain(once.iter()) {
            listener(event);
        }

        if !wildcard.is_empty() {
            let erased = event.erase();

            for listener in &wildcard {
                listener(&erased);
            }
        }
    }

    /// Count of persistent and one-shot listeners registered for `E`.
    #[must_use]
    pub fn listener_count<E: Poolable>(&self) -> usize {
        self.inner
            .registry
            .borrow()
            .typed::<E>()
            .map_or(0, |listeners| {
                listeners
                    .persistent
                    .len()
                    .saturating_add(listeners.once.len())
            })
    }

    /// Count of wildcard listeners.
    #[must_use]
    pub fn wildcard_count(&self) -> usize {
        self.inner.registry.borrow().wildcard.len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry.borrow();

        f.debug_struct(type_name::<Self>())
            .field("pool", &self.inner.pool)
            .field("event_types", &registry.typed.len())
            .field("wildcard", &registry.wildcard.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;

    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::Error;

    assert_not_impl_any!(EventBus: Send, Sync);

    #[derive(Default)]
    struct Ping {
        value: u32,
    }

    impl Poolable for Ping {
        fn reset(&mut self) {
            self.value = 0;
        }
    }

    #[derive(Default)]
    struct Pong;

    impl Poolable for Pong {
        fn reset(&mut self) {}
    }

    struct Unregistered;

    impl Poolable for Unregistered {
        fn reset(&mut self) {}
    }

    fn bus() -> EventBus {
        let pool = ObjectPool::new();
        pool.register::<Ping>();
        pool.register::<Pong>();
        EventBus::new(pool)
    }

    fn recorder() -> Rc<RefCell<Vec<&'static str>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    #[test]
    fn publish_with_no_listeners_is_ok() {
        let bus = bus();

        bus.publish::<Ping>().unwrap();
    }

    #[test]
    fn publish_unregistered_type_is_invalid() {
        let bus = bus();

        assert!(matches!(
            bus.publish::<Unregistered>(),
            Err(Error::InvalidType { .. })
        ));
    }

    #[test]
    fn listeners_receive_initialized_event() {
        let bus = bus();
        let seen = Rc::new(Cell::new(0));

        bus.subscribe::<Ping, _>({
            let seen = Rc::clone(&seen);
            move |ping| seen.set(ping.borrow().value)
        });

        bus.publish_with::<Ping>(|ping| ping.value = 12).unwrap();

        assert_eq!(seen.get(), 12);
    }

    #[test]
    fn event_is_freed_after_dispatch() {
        let bus = bus();

        bus.publish::<Ping>().unwrap();
        bus.publish::<Ping>().unwrap();

        assert_eq!(bus.pool().constructed_count::<Ping>(), 1);
        assert_eq!(bus.pool().idle_count::<Ping>(), 1);
    }

    #[test]
    fn listeners_only_receive_their_type() {
        let bus = bus();
        let pings = Rc::new(Cell::new(0));

        bus.subscribe::<Ping, _>({
            let pings = Rc::clone(&pings);
            move |_| pings.set(pings.get() + 1)
        });

        bus.publish::<Pong>().unwrap();
        assert_eq!(pings.get(), 0);

        bus.publish::<Ping>().unwrap();
        assert_eq!(pings.get(), 1);
    }

    #[test]
    fn dispatch_order_is_persistent_then_once_then_wildcard() {
        let bus = bus();
        let log = recorder();

        bus.subscribe_all({
            let log = Rc::clone(&log);
            move |_| log.borrow_mut().push("wildcard")
        });
        bus.subscribe_once::<Ping, _>({
            let log = Rc::clone(&log);
            move |_| log.borrow_mut().push("once")
        });
        bus.subscribe::<Ping, _>({
            let log = Rc::clone(&log);
            move |_| log.borrow_mut().push("first")
        });
        bus.subscribe::<Ping, _>({
            let log = Rc::clone(&log);
            move |_| log.borrow_mut().push("second")
        });

        bus.publish::<Ping>().unwrap();

        assert_eq!(*log.borrow(), vec!["first", "second", "once", "wildcard"]);
    }

    #[test]
    fn once_listener_fires_exactly_once() {
        let bus = bus();
        let hits = Rc::new(Cell::new(0));

        bus.subscribe_once::<Ping, _>({
            let hits = Rc::clone(&hits);
            move |_| hits.set(hits.get() + 1)
        });
        assert_eq!(bus.listener_count::<Ping>(), 1);

        bus.publish::<Ping>().unwrap();
        bus.publish::<Ping>().unwrap();

        assert_eq!(hits.get(), 1);
        assert_eq!(bus.listener_count::<Ping>(), 0);
    }

    #[test]
    fn once_listener_subscribed_during_dispatch_fires_on_next_publish() {
        let bus = bus();
        let hits = Rc::new(Cell::new(0));

        bus.subscribe_once::<Ping, _>({
            let bus = bus.clone();
            let hits = Rc::clone(&hits);
            move |_| {
                let hits = Rc::clone(&hits);
                bus.subscribe_once::<Ping, _>(move |_| hits.set(hits.get() + 1));
            }
        });

        bus.publish::<Ping>().unwrap();
        assert_eq!(hits.get(), 0);

        bus.publish::<Ping>().unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn wildcard_receives_every_type() {
        let bus = bus();
        let log = recorder();

        bus.subscribe_all({
            let log = Rc::clone(&log);
            move |event| {
                if event.is::<Ping>() {
                    log.borrow_mut().push("ping");
                } else if event.is::<Pong>() {
                    log.borrow_mut().push("pong");
                }
            }
        });

        bus.publish::<Ping>().unwrap();
        bus.publish::<Pong>().unwrap();

        assert_eq!(*log.borrow(), vec!["ping", "pong"]);
    }

    #[test]
    fn self_removal_does_not_skip_other_listeners() {
        let bus = bus();
        let log = recorder();
        let own_id = Rc::new(Cell::new(None));

        let id = bus.subscribe::<Ping, _>({
            let bus = bus.clone();
            let log = Rc::clone(&log);
            let own_id = Rc::clone(&own_id);
            move |_| {
                log.borrow_mut().push("self-removing");
                if let Some(id) = own_id.get() {
                    assert!(bus.unsubscribe::<Ping>(id));
                }
            }
        });
        own_id.set(Some(id));

        bus.subscribe::<Ping, _>({
            let log = Rc::clone(&log);
            move |_| log.borrow_mut().push("after")
        });

        bus.publish::<Ping>().unwrap();
        bus.publish::<Ping>().unwrap();

        assert_eq!(*log.borrow(), vec!["self-removing", "after", "after"]);
    }

    #[test]
    fn removal_of_later_listener_takes_effect_next_dispatch() {
        let bus = bus();
        let log = recorder();
        let victim = Rc::new(Cell::new(None));

        bus.subscribe::<Ping, _>({
            let bus = bus.clone();
            let victim = Rc::clone(&victim);
            move |_| {
                if let Some(id) = victim.get() {
                    bus.unsubscribe::<Ping>(id);
                }
            }
        });

        let id = bus.subscribe::<Ping, _>({
            let log = Rc::clone(&log);
            move |_| log.borrow_mut().push("victim")
        });
        victim.set(Some(id));

        bus.publish::<Ping>().unwrap();
        bus.publish::<Ping>().unwrap();

        assert_eq!(*log.borrow(), vec!["victim"]);
    }

    #[test]
    fn listener_added_during_dispatch_is_not_invoked_in_same_pass() {
        let bus = bus();
        let hits = Rc::new(Cell::new(0));

        bus.subscribe_once::<Ping, _>({
            let bus = bus.clone();
            let hits = Rc::clone(&hits);
            move |_| {
                let hits = Rc::clone(&hits);
                bus.subscribe::<Ping, _>(move |_| hits.set(hits.get() + 1));
            }
        });

        bus.publish::<Ping>().unwrap();
        assert_eq!(hits.get(), 0);

        bus.publish::<Ping>().unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn publish_from_inside_listener_is_dispatched_immediately() {
        let bus = bus();
        let log = recorder();

        bus.subscribe::<Ping, _>({
            let bus = bus.clone();
            let log = Rc::clone(&log);
            move |_| {
                log.borrow_mut().push("ping");
                bus.publish::<Pong>().unwrap();
                log.borrow_mut().push("ping done");
            }
        });
        bus.subscribe::<Pong, _>({
            let log = Rc::clone(&log);
            move |_| log.borrow_mut().push("pong")
        });

        bus.publish::<Ping>().unwrap();

        assert_eq!(*log.borrow(), vec!["ping", "pong", "ping done"]);
    }

    #[test]
    fn unsubscribe_removes_from_every_list() {
        let bus = bus();

        let persistent = bus.subscribe::<Ping, _>(|_| {});
        let once = bus.subscribe_once::<Ping, _>(|_| {});
        let wildcard = bus.subscribe_all(|_| {});

        assert!(bus.unsubscribe::<Ping>(persistent));
        assert!(bus.unsubscribe::<Ping>(once));
        assert!(bus.unsubscribe::<Ping>(wildcard));
        assert!(!bus.unsubscribe::<Ping>(persistent));

        assert_eq!(bus.listener_count::<Ping>(), 0);
        assert_eq!(bus.wildcard_count(), 0);
    }

    #[test]
    fn unsubscribe_wildcard_leaves_typed_listeners() {
        let bus = bus();

        let typed = bus.subscribe::<Ping, _>(|_| {});
        let wildcard = bus.subscribe_all(|_| {});

        assert!(!bus.unsubscribe_wildcard(typed));
        assert!(bus.unsubscribe_wildcard(wildcard));
        assert_eq!(bus.listener_count::<Ping>(), 1);
    }

    #[test]
    fn unkept_event_is_reset_before_going_idle() {
        let bus = bus();
        let seen = Rc::new(RefCell::new(None));

        bus.subscribe_once::<Ping, _>({
            let seen = Rc::clone(&seen);
            move |ping| *seen.borrow_mut() = Some(ping.clone())
        });

        bus.publish_with::<Ping>(|ping| ping.value = 9).unwrap();

        let idle = seen.borrow_mut().take().unwrap();
        assert_eq!(idle.borrow().value, 0);
        assert_eq!(bus.pool().idle_count::<Ping>(), 1);
    }

    #[test]
    fn listener_may_keep_event_alive_with_lock() {
        let bus = bus();
        let kept = Rc::new(RefCell::new(None));
        let key = bus.pool().new_lock_key();

        bus.subscribe_once::<Ping, _>({
            let pool = bus.pool().clone();
            let kept = Rc::clone(&kept);
            move |ping| {
                pool.lock(ping, key).unwrap();
                *kept.borrow_mut() = Some(ping.clone());
            }
        });

        bus.publish_with::<Ping>(|ping| ping.value = 3).unwrap();
        bus.publish::<Ping>().unwrap();

        let kept = kept.borrow_mut().take().unwrap();
        assert_eq!(kept.borrow().value, 3);
        assert_eq!(bus.pool().constructed_count::<Ping>(), 2);

        bus.pool().unlock(&kept, key).unwrap();
        assert_eq!(bus.pool().idle_count::<Ping>(), 2);
    }
}

use std::any::{TypeId, type_name};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use foldhash::{HashMap, HashMapExt};
use tracing::{debug, error};

use crate::{
    ChainBuilder, ChainDescriptor, ChainEngine, ChainId, ChainStart, ErasedPooled, EventBus,
    LaunchEngine, ListenerId, LockKey, ObjectPool, Poolable, Pooled, Result, Step,
};

/// Binds published events to the chains that react to them.
///
/// Chains are declared with [`on()`][Self::on]. Every publish of an event type then starts one
/// independent run per chain installed for that type. Each run gets its own pooled engine
/// and holds a lock on the triggering event until it ends, so runs that are parked on a
/// retained step never observe their event being recycled for a later publish.
///
/// Standalone steps can be run with [`launch()`][Self::launch] without any event involved.
///
/// # Example
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// use chain_relay::{EventBus, ObjectPool, Outcome, Poolable, Relay, Step, StepContext};
///
/// #[derive(Default)]
/// struct Greet {
///     name: String,
/// }
///
/// impl Poolable for Greet {
///     fn reset(&mut self) {
///         self.name.clear();
///     }
/// }
///
/// struct SayHello {
///     greeted: Rc<Cell<u32>>,
/// }
///
/// impl Poolable for SayHello {
///     fn reset(&mut self) {}
/// }
///
/// impl Step for SayHello {
///     fn execute(&mut self, _context: StepContext) -> Outcome {
///         self.greeted.set(self.greeted.get() + 1);
///         Outcome::Done
///     }
/// }
///
/// let greeted = Rc::new(Cell::new(0));
///
/// let pool = ObjectPool::new();
/// pool.register::<Greet>();
/// pool.register_with({
///     let greeted = Rc::clone(&greeted);
///     move || SayHello {
///         greeted: Rc::clone(&greeted),
///     }
/// });
///
/// let relay = Relay::new(EventBus::new(pool));
/// relay.on::<Greet>().add_step::<SayHello>().install().unwrap();
///
/// relay.bus().publish::<Greet>().unwrap();
/// relay.launch::<SayHello>().unwrap();
///
/// assert_eq!(greeted.get(), 2);
/// assert_eq!(relay.active_count(), 0);
/// ```
///
/// # Single-threaded design
///
/// This type is a cloneable handle to shared state and is neither [`Send`] nor [`Sync`].
#[derive(Clone)]
pub struct Relay {
    inner: Rc<RelayCore>,
}

pub(crate) struct RelayCore {
    bus: EventBus,
    chains: RefCell<HashMap<TypeId, Vec<InstalledChain>>>,

    /// Engines of the runs and launches that have not ended yet, by run key.
    active: RefCell<HashMap<LockKey, ErasedPooled>>,
    next_chain: Cell<u64>,
}

struct InstalledChain {
    id: ChainId,
    listener: ListenerId,
}

impl Relay {
    /// Creates a relay that reacts to events published on `bus`.
    ///
    /// Engines and steps are allocated from the pool of the bus.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Rc::new(RelayCore {
                bus,
                chains: RefCell::new(HashMap::new()),
                active: RefCell::new(HashMap::new()),
                next_chain: Cell::new(0),
            }),
        }
    }

    /// The bus this relay listens on.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// The pool engines and steps are allocated from.
    #[must_use]
    pub fn pool(&self) -> &ObjectPool {
        self.inner.bus.pool()
    }

    /// Starts declaring a chain that runs on every publish of `E`.
    ///
    /// Any number of chains may be installed for the same event type; each one runs
    /// independently on every publish.
    pub fn on<E: Poolable>(&self) -> ChainBuilder<E> {
        ChainBuilder::new(self.clone())
    }

    pub(crate) fn install_chain<E: Poolable>(
        &self,
        describe: impl FnOnce(ChainId) -> ChainDescriptor<E>,
    ) -> ChainId {
        let id = ChainId::from_raw(self.inner.next_chain.get());
        self.inner
            .next_chain
            .set(self.inner.next_chain.get().wrapping_add(1));

        let chain = Rc::new(describe(id));

        self.pool()
            .ensure_registered_with::<ChainEngine<E>, _>(ChainEngine::default);

        debug!(
            event_type = type_name::<E>(),
            chain = %id,
            steps = chain.len(),
            "chain installed"
        );

        let relay = Rc::downgrade(&self.inner);
        let listener = self.inner.bus.subscribe::<E, _>(move |event| {
            if let Some(relay) = relay.upgrade() {
                relay.trigger(&chain, event);
            }
        });

        self.inner
            .chains
            .borrow_mut()
            .entry(TypeId::of::<E>())
            .or_default()
            .push(InstalledChain { id, listener });

        id
    }

    /// Stops running the chain on publishes of `E`, returning whether it was installed.
    ///
    /// Runs of the chain that are already in flight are not affected.
    pub fn uninstall<E: Poolable>(&self, chain: ChainId) -> bool {
        let listener = {
            let mut chains = self.inner.chains.borrow_mut();
            let Some(installed) = chains.get_mut(&TypeId::of::<E>()) else {
                return false;
            };

            let Some(index) = installed.iter().position(|entry| entry.id == chain) else {
                return false;
            };

            installed.remove(index).listener
        };

        debug!(event_type = type_name::<E>(), %chain, "chain uninstalled");

        self.inner.bus.unsubscribe::<E>(listener)
    }

    /// Runs a single step of type `S` in its reset state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidType`][crate::Error::InvalidType] if `S` is not registered with
    /// the pool.
    pub fn launch<S: Step>(&self) -> Result<()> {
        self.launch_with::<S>(|_| {})
    }

    /// Runs a single step of type `S`, populated by `initializer` before it runs.
    ///
    /// The step is freed once it reports success or failure, either right away or later
    /// through its retained completion handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidType`][crate::Error::InvalidType] if `S` is not registered with
    /// the pool.
    pub fn launch_with<S: Step>(&self, initializer: impl FnOnce(&mut S)) -> Result<()> {
        let pool = self.pool();
        pool.ensure_registered_with::<LaunchEngine<S>, _>(LaunchEngine::default);

        let step = pool.allocate::<S>()?;
        initializer(&mut *step.borrow_mut());

        let engine = match pool.allocate::<LaunchEngine<S>>() {
            Ok(engine) => engine,
            Err(error) => {
                pool.free(step)?;
                return Err(error);
            }
        };

        let key = pool.new_lock_key();
        self.inner.active.borrow_mut().insert(key, engine.erase());

        LaunchEngine::start(
            engine.cell(),
            key,
            Rc::downgrade(&self.inner),
            pool.clone(),
            step,
        );

        Ok(())
    }

    /// Count of chain runs and launches that have started but not yet ended.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.borrow().len()
    }

    /// Count of chains installed for `E`.
    #[must_use]
    pub fn chain_count<E: Poolable>(&self) -> usize {
        self.inner
            .chains
            .borrow()
            .get(&TypeId::of::<E>())
            .map_or(0, Vec::len)
    }
}

impl RelayCore {
    /// Starts a run of `chain` for a freshly published event.
    fn trigger<E: Poolable>(self: &Rc<Self>, chain: &Rc<ChainDescriptor<E>>, event: &Pooled<E>) {
        let pool = self.bus.pool();

        let engine = match pool.allocate::<ChainEngine<E>>() {
            Ok(engine) => engine,
            Err(error) => {
                error!(%error, chain = %chain.id(), "failed to allocate chain engine");
                return;
            }
        };

        let key = pool.new_lock_key();
        self.active.borrow_mut().insert(key, engine.erase());

        let start = ChainStart {
            key,
            relay: Rc::downgrade(self),
            pool: pool.clone(),
            chain: Rc::clone(chain),
            event: event.clone(),
        };

        if let Err(error) = ChainEngine::start(engine.cell(), start) {
            error!(%error, chain = %chain.id(), run = %key, "failed to start chain run");
            self.finish(key);
        }
    }

    /// Returns the engine of an ended run or launch to the pool.
    pub(crate) fn finish(&self, key: LockKey) {
        let engine = self.active.borrow_mut().remove(&key);

        if let Some(engine) = engine {
            if let Err(error) = self.bus.pool().free_erased(engine.type_key(), Some(&engine)) {
                error!(%error, run = %key, "failed to free engine");
            }
        }
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("bus", &self.inner.bus)
            .field("chain_types", &self.inner.chains.borrow().len())
            .field("active", &self.inner.active.borrow().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::{Error, Outcome, StepCompletion, StepContext};

    assert_not_impl_any!(Relay: Send, Sync);

    thread_local! {
        static PENDING: RefCell<Option<StepCompletion>> = const { RefCell::new(None) };
        static LOG: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
    }

    fn log(entry: &'static str) {
        LOG.with(|log| log.borrow_mut().push(entry));
    }

    fn take_log() -> Vec<&'static str> {
        LOG.with(|log| log.borrow_mut().drain(..).collect())
    }

    #[derive(Default)]
    struct Trigger;

    impl Poolable for Trigger {
        fn reset(&mut self) {}
    }

    #[derive(Default)]
    struct Succeed;

    impl Poolable for Succeed {
        fn reset(&mut self) {}
    }

    impl Step for Succeed {
        fn execute(&mut self, _context: StepContext) -> Outcome {
            log("succeed");
            Outcome::Done
        }
    }

    #[derive(Default)]
    struct Wait;

    impl Poolable for Wait {
        fn reset(&mut self) {}
    }

    impl Step for Wait {
        fn execute(&mut self, context: StepContext) -> Outcome {
            log("wait");
            PENDING.with(|pending| *pending.borrow_mut() = Some(context.retain()));
            Outcome::Retained
        }
    }

    struct Unregistered;

    impl Poolable for Unregistered {
        fn reset(&mut self) {}
    }

    impl Step for Unregistered {
        fn execute(&mut self, _context: StepContext) -> Outcome {
            Outcome::Done
        }
    }

    fn relay() -> Relay {
        take_log();
        PENDING.with(|pending| pending.borrow_mut().take());

        let pool = ObjectPool::new();
        pool.register::<Trigger>();
        pool.register::<Succeed>();
        pool.register::<Wait>();
        Relay::new(EventBus::new(pool))
    }

    fn complete_pending() {
        let completion = PENDING.with(|pending| pending.borrow_mut().take());
        completion.unwrap().done();
    }

    #[test]
    fn every_installed_chain_runs_on_publish() {
        let relay = relay();
        relay.on::<Trigger>().add_step::<Succeed>().install().unwrap();
        relay.on::<Trigger>().add_step::<Succeed>().install().unwrap();

        relay.bus().publish::<Trigger>().unwrap();

        assert_eq!(take_log(), vec!["succeed", "succeed"]);
        assert_eq!(relay.active_count(), 0);
    }

    #[test]
    fn retained_run_stays_active_until_completed() {
        let relay = relay();
        relay
            .on::<Trigger>()
            .add_step::<Wait>()
            .add_step::<Succeed>()
            .install()
            .unwrap();

        relay.bus().publish::<Trigger>().unwrap();
        assert_eq!(take_log(), vec!["wait"]);
        assert_eq!(relay.active_count(), 1);

        complete_pending();
        assert_eq!(take_log(), vec!["succeed"]);
        assert_eq!(relay.active_count(), 0);
    }

    #[test]
    fn engines_are_reused_across_runs() {
        let relay = relay();
        relay.on::<Trigger>().add_step::<Succeed>().install().unwrap();

        relay.bus().publish::<Trigger>().unwrap();
        relay.bus().publish::<Trigger>().unwrap();
        relay.bus().publish::<Trigger>().unwrap();

        assert_eq!(relay.pool().constructed_count::<ChainEngine<Trigger>>(), 1);
        assert_eq!(relay.pool().constructed_count::<Succeed>(), 1);
    }

    #[test]
    fn uninstalled_chain_no_longer_runs() {
        let relay = relay();
        let chain = relay.on::<Trigger>().add_step::<Succeed>().install().unwrap();

        assert!(relay.uninstall::<Trigger>(chain));
        assert!(!relay.uninstall::<Trigger>(chain));
        assert_eq!(relay.chain_count::<Trigger>(), 0);

        relay.bus().publish::<Trigger>().unwrap();
        assert!(take_log().is_empty());
    }

    #[test]
    fn uninstall_leaves_runs_in_flight() {
        let relay = relay();
        let chain = relay
            .on::<Trigger>()
            .add_step::<Wait>()
            .add_step::<Succeed>()
            .install()
            .unwrap();

        relay.bus().publish::<Trigger>().unwrap();
        relay.uninstall::<Trigger>(chain);

        complete_pending();
        assert_eq!(take_log(), vec!["wait", "succeed"]);
        assert_eq!(relay.active_count(), 0);
    }

    #[test]
    fn launch_runs_step_and_frees_it() {
        let relay = relay();

        relay.launch::<Succeed>().unwrap();

        assert_eq!(take_log(), vec!["succeed"]);
        assert_eq!(relay.active_count(), 0);
        assert_eq!(relay.pool().idle_count::<Succeed>(), 1);
        assert_eq!(relay.pool().outstanding_count(), 0);
    }

    #[test]
    fn retained_launch_finishes_on_signal() {
        let relay = relay();

        relay.launch::<Wait>().unwrap();
        assert_eq!(relay.active_count(), 1);
        assert_eq!(relay.pool().idle_count::<Wait>(), 0);

        complete_pending();
        assert_eq!(relay.active_count(), 0);
        assert_eq!(relay.pool().idle_count::<Wait>(), 1);
    }

    #[test]
    fn launch_of_unregistered_step_is_invalid() {
        let relay = relay();

        assert!(matches!(
            relay.launch::<Unregistered>(),
            Err(Error::InvalidType { .. })
        ));
        assert_eq!(relay.active_count(), 0);
    }
}

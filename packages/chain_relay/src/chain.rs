use std::any::type_name;
use std::fmt;

use crate::{
    ChainOutcome, Error, Initializer, Poolable, Pooled, Relay, Result, Step, StepAllocator,
    TypeKey, TypedStepAllocator,
};

/// Identity of a chain installed on a [`Relay`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ChainId(u64);

impl ChainId {
    pub(crate) const fn from_raw(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain#{}", self.0)
    }
}

/// Invoked with the triggering event when a run of the chain ends.
pub(crate) type FinishHook<E> = Box<dyn Fn(&Pooled<E>, ChainOutcome)>;

type BoxedAllocator<E> = Box<dyn StepAllocator<E>>;

/// The frozen form of a chain: what runs, in which order, and what runs on failure.
pub(crate) struct ChainDescriptor<E: Poolable> {
    id: ChainId,
    steps: Vec<BoxedAllocator<E>>,
    failure: Option<BoxedAllocator<E>>,
    on_finish: Option<FinishHook<E>>,
}

impl<E: Poolable> ChainDescriptor<E> {
    pub(crate) fn id(&self) -> ChainId {
        self.id
    }

    pub(crate) fn step(&self, index: usize) -> Option<&dyn StepAllocator<E>> {
        self.steps.get(index).map(Box::as_ref)
    }

    pub(crate) fn failure(&self) -> Option<&dyn StepAllocator<E>> {
        self.failure.as_deref()
    }

    pub(crate) fn has_failure(&self) -> bool {
        self.failure.is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.steps.len()
    }

    pub(crate) fn notify_finished(&self, event: &Pooled<E>, outcome: ChainOutcome) {
        if let Some(hook) = &self.on_finish {
            hook(event, outcome);
        }
    }
}

/// Declares the steps a [`Relay`] runs whenever an event of type `E` is published.
///
/// Obtained from [`Relay::on()`]. Steps run in the order they are added. The chain takes
/// effect once [`install()`][Self::install] is called, after which it can no longer change.
///
/// # Example
///
/// ```
/// use chain_relay::{EventBus, ObjectPool, Outcome, Poolable, Relay, Step, StepContext};
///
/// #[derive(Default)]
/// struct OrderPlaced {
///     quantity: u32,
/// }
///
/// impl Poolable for OrderPlaced {
///     fn reset(&mut self) {
///         self.quantity = 0;
///     }
/// }
///
/// #[derive(Default)]
/// struct ReserveStock {
///     quantity: u32,
/// }
///
/// impl Poolable for ReserveStock {
///     fn reset(&mut self) {
///         self.quantity = 0;
///     }
/// }
///
/// impl Step for ReserveStock {
///     fn execute(&mut self, _context: StepContext) -> Outcome {
///         if self.quantity <= 10 {
///             Outcome::Done
///         } else {
///             Outcome::Failed
///         }
///     }
/// }
///
/// #[derive(Default)]
/// struct NotifyOutOfStock;
///
/// impl Poolable for NotifyOutOfStock {
///     fn reset(&mut self) {}
/// }
///
/// impl Step for NotifyOutOfStock {
///     fn execute(&mut self, _context: StepContext) -> Outcome {
///         Outcome::Done
///     }
/// }
///
/// let pool = ObjectPool::new();
/// pool.register::<OrderPlaced>();
/// pool.register::<ReserveStock>();
/// pool.register::<NotifyOutOfStock>();
///
/// let relay = Relay::new(EventBus::new(pool));
///
/// relay
///     .on::<OrderPlaced>()
///     .add_step_with::<ReserveStock, _>(|step, order| step.quantity = order.borrow().quantity)
///     .on_failure::<NotifyOutOfStock>()
///     .install()
///     .unwrap();
///
/// relay
///     .bus()
///     .publish_with::<OrderPlaced>(|order| order.quantity = 3)
///     .unwrap();
/// ```
#[must_use = "a chain does nothing until it is installed"]
pub struct ChainBuilder<E: Poolable> {
    relay: Relay,
    steps: Vec<BoxedAllocator<E>>,
    failure: Option<BoxedAllocator<E>>,
    on_finish: Option<FinishHook<E>>,
}

impl<E: Poolable> ChainBuilder<E> {
    pub(crate) fn new(relay: Relay) -> Self {
        Self {
            relay,
            steps: Vec::new(),
            failure: None,
            on_finish: None,
        }
    }

    /// Appends a step of type `S`, which runs in its reset state.
    pub fn add_step<S: Step>(mut self) -> Self {
        self.steps.push(allocator::<S, E>(None));
        self
    }

    /// Appends a step of type `S`, which is populated from the triggering event by
    /// `initializer` before it runs.
    pub fn add_step_with<S, F>(mut self, initializer: F) -> Self
    where
        S: Step,
        F: Fn(&mut S, &Pooled<E>) + 'static,
    {
        self.steps.push(allocator::<S, E>(Some(Box::new(initializer))));
        self
    }

    /// Sets the step that runs when any step of the chain fails.
    ///
    /// The failure step runs at most once per run; if it fails in turn, the run simply ends.
    /// Setting a failure step again replaces the earlier one.
    pub fn on_failure<S: Step>(mut self) -> Self {
        self.failure = Some(allocator::<S, E>(None));
        self
    }

    /// Sets the step that runs when any step of the chain fails, populated from the
    /// triggering event by `initializer`.
    pub fn on_failure_with<S, F>(mut self, initializer: F) -> Self
    where
        S: Step,
        F: Fn(&mut S, &Pooled<E>) + 'static,
    {
        self.failure = Some(allocator::<S, E>(Some(Box::new(initializer))));
        self
    }

    /// Sets a hook invoked with the triggering event and the outcome whenever a run of the
    /// chain ends.
    ///
    /// The event is still locked by the run while the hook executes.
    pub fn on_finish<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Pooled<E>, ChainOutcome) + 'static,
    {
        self.on_finish = Some(Box::new(hook));
        self
    }

    /// Freezes the chain and starts running it on every publish of `E`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidType`] if `E` or any of the step types is not registered with
    /// the pool of the relay.
    pub fn install(self) -> Result<ChainId> {
        let pool = self.relay.pool();

        if !pool.is_registered::<E>() {
            return Err(Error::InvalidType {
                type_name: type_name::<E>(),
            });
        }

        if let Some(step_type) = self
            .steps
            .iter()
            .chain(self.failure.iter())
            .map(|step| step.step_type())
            .find(|step_type| !pool.is_registered_key(*step_type))
        {
            return Err(Error::InvalidType {
                type_name: step_type.name(),
            });
        }

        Ok(self.relay.install_chain(|id| ChainDescriptor {
            id,
            steps: self.steps,
            failure: self.failure,
            on_finish: self.on_finish,
        }))
    }
}

impl<E: Poolable> fmt::Debug for ChainBuilder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<TypeKey> = self.steps.iter().map(|step| step.step_type()).collect();

        f.debug_struct(type_name::<Self>())
            .field("steps", &steps)
            .field("failure", &self.failure.as_ref().map(|step| step.step_type()))
            .field("on_finish", &self.on_finish.is_some())
            .finish_non_exhaustive()
    }
}

fn allocator<S: Step, E: Poolable>(initializer: Option<Initializer<S, E>>) -> BoxedAllocator<E> {
    Box::new(TypedStepAllocator::<S, E>::new(initializer))
}

use std::any::{TypeId, type_name};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use foldhash::{HashMap, HashMapExt};
use tracing::trace;

use crate::{Error, ErasedPooled, EventBus, Poolable, Pooled, Result};

/// Published on the bus after a model has been created by a [`ModelRegistry`].
pub struct ModelCreated<M: Poolable> {
    model: Option<Pooled<M>>,
}

/// Published on the bus after a model has been removed from a [`ModelRegistry`], right before
/// the model is freed back to the pool.
pub struct ModelDestroyed<M: Poolable> {
    model: Option<Pooled<M>>,
}

macro_rules! lifecycle_event {
    ($name:ident) => {
        impl<M: Poolable> $name<M> {
            /// The model the event is about.
            #[must_use]
            pub fn model(&self) -> Option<&Pooled<M>> {
                self.model.as_ref()
            }
        }

        impl<M: Poolable> Default for $name<M> {
            fn default() -> Self {
                Self { model: None }
            }
        }

        impl<M: Poolable> Poolable for $name<M> {
            fn reset(&mut self) {
                self.model = None;
            }
        }

        impl<M: Poolable> fmt::Debug for $name<M> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(type_name::<Self>())
                    .field("model", &self.model)
                    .finish()
            }
        }
    };
}

lifecycle_event!(ModelCreated);
lifecycle_event!(ModelDestroyed);

/// Keeps track of live pooled models and announces their creation and destruction on an
/// [`EventBus`].
///
/// # Example
///
/// ```
/// use chain_relay::{EventBus, ModelCreated, ModelRegistry, ObjectPool, Poolable};
///
/// #[derive(Default)]
/// struct Player {
///     name: String,
/// }
///
/// impl Poolable for Player {
///     fn reset(&mut self) {
///         self.name.clear();
///     }
/// }
///
/// let pool = ObjectPool::new();
/// pool.register::<Player>();
/// let bus = EventBus::new(pool);
/// let registry = ModelRegistry::new(bus.clone());
///
/// // The registry registers its lifecycle events on first use; subscribing works regardless.
/// bus.subscribe::<ModelCreated<Player>, _>(|event| {
///     let player = event.borrow().model().unwrap().clone();
///     println!("welcome, {}", player.borrow().name);
/// });
///
/// let player = registry
///     .create_with::<Player>(|player| player.name.push_str("ferris"))
///     .unwrap();
/// assert_eq!(registry.count::<Player>(), 1);
///
/// registry.destroy(Some(&player)).unwrap();
/// assert_eq!(registry.count::<Player>(), 0);
/// ```
///
/// # Single-threaded design
///
/// This type is a cloneable handle to shared state and is neither [`Send`] nor [`Sync`].
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Rc<RegistryCore>,
}

struct RegistryCore {
    bus: EventBus,

    /// Live models of each type, in creation order.
    models: RefCell<HashMap<TypeId, Vec<ErasedPooled>>>,
}

impl ModelRegistry {
    /// Creates a registry that allocates models from the pool of `bus` and announces them on
    /// `bus`.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Rc::new(RegistryCore {
                bus,
                models: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Creates a model in its reset state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidType`] if `M` is not registered with the pool.
    pub fn create<M: Poolable>(&self) -> Result<Pooled<M>> {
        self.create_with::<M>(|_| {})
    }

    /// Creates a model populated by `initializer`, then publishes [`ModelCreated`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidType`] if `M` is not registered with the pool.
    pub fn create_with<M: Poolable>(&self, initializer: impl FnOnce(&mut M)) -> Result<Pooled<M>> {
        self.ensure_events_registered::<M>();

        let model = self.inner.bus.pool().allocate::<M>()?;
        initializer(&mut *model.borrow_mut());

        self.inner
            .models
            .borrow_mut()
            .entry(TypeId::of::<M>())
            .or_default()
            .push(model.erase());

        trace!(model_type = type_name::<M>(), instance = %model.instance_id(), "model created");

        self.inner
            .bus
            .publish_with::<ModelCreated<M>>(|event| event.model = Some(model.clone()))?;

        Ok(model)
    }

    /// Live models of type `M`, in creation order.
    #[must_use]
    pub fn models<M: Poolable>(&self) -> Vec<Pooled<M>> {
        self.inner
            .models
            .borrow()
            .get(&TypeId::of::<M>())
            .map(|models| models.iter().filter_map(ErasedPooled::downcast::<M>).collect())
            .unwrap_or_default()
    }

    /// Count of live models of type `M`.
    #[must_use]
    pub fn count<M: Poolable>(&self) -> usize {
        self.inner
            .models
            .borrow()
            .get(&TypeId::of::<M>())
            .map_or(0, Vec::len)
    }

    /// Removes a model, publishes [`ModelDestroyed`] and frees the model to the pool.
    ///
    /// Destroying a model that is not live in this registry is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NullModel`] if `model` is `None`.
    pub fn destroy<M: Poolable>(&self, model: Option<&Pooled<M>>) -> Result<()> {
        let model = model.ok_or(Error::NullModel {
            type_name: type_name::<M>(),
        })?;

        let removed = {
            let mut models = self.inner.models.borrow_mut();

            models.get_mut(&TypeId::of::<M>()).and_then(|live| {
                live.iter()
                    .position(|entry| entry.slot() == model.slot())
                    .map(|index| live.remove(index))
            })
        };

        if removed.is_none() {
            trace!(
                model_type = type_name::<M>(),
                instance = %model.instance_id(),
                "ignoring destroy of model that is not live"
            );
            return Ok(());
        }

        self.ensure_events_registered::<M>();

        self.inner
            .bus
            .publish_with::<ModelDestroyed<M>>(|event| event.model = Some(model.clone()))?;

        trace!(model_type = type_name::<M>(), instance = %model.instance_id(), "model destroyed");

        self.inner.bus.pool().free(model.clone())
    }

    fn ensure_events_registered<M: Poolable>(&self) {
        let pool = self.inner.bus.pool();
        pool.ensure_registered_with::<ModelCreated<M>, _>(ModelCreated::default);
        pool.ensure_registered_with::<ModelDestroyed<M>, _>(ModelDestroyed::default);
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("model_types", &self.inner.models.borrow().len())
            .finish_non_exhaustive()
    }
}

use std::any::type_name;

use crate::{
    Error, ErasedPooled, ObjectPool, Outcome, Poolable, Pooled, Result, Step, StepContext, TypeKey,
};

/// Per-step initializer, applied to a freshly allocated step before it runs.
pub(crate) type Initializer<S, E> = Box<dyn Fn(&mut S, &Pooled<E>)>;

/// Allocates, initializes and runs one kind of step on behalf of a chain triggered by `E`.
///
/// This is the seam that lets a chain hold steps of many different types in one list.
pub(crate) trait StepAllocator<E: Poolable> {
    fn step_type(&self) -> TypeKey;

    /// Allocates the step from the pool and applies the initializer against the event.
    fn allocate(&self, pool: &ObjectPool, event: &Pooled<E>) -> Result<ErasedPooled>;

    /// Runs a step previously returned by [`allocate()`][Self::allocate].
    fn execute(&self, step: &ErasedPooled, context: StepContext) -> Result<Outcome>;
}

pub(crate) struct TypedStepAllocator<S, E> {
    initializer: Option<Initializer<S, E>>,
}

impl<S: Step, E: Poolable> TypedStepAllocator<S, E> {
    pub(crate) fn new(initializer: Option<Initializer<S, E>>) -> Self {
        Self { initializer }
    }
}

impl<S: Step, E: Poolable> StepAllocator<E> for TypedStepAllocator<S, E> {
    fn step_type(&self) -> TypeKey {
        TypeKey::of::<S>()
    }

    fn allocate(&self, pool: &ObjectPool, event: &Pooled<E>) -> Result<ErasedPooled> {
        let step = pool.allocate::<S>()?;

        if let Some(initializer) = &self.initializer {
            initializer(&mut *step.borrow_mut(), event);
        }

        Ok(step.erase())
    }

    fn execute(&self, step: &ErasedPooled, context: StepContext) -> Result<Outcome> {
        let cell = step.cell::<S>().ok_or(Error::MismatchedType {
            expected: type_name::<S>(),
            actual: step.type_key().name(),
        })?;

        Ok(cell.borrow_mut().execute(context))
    }
}

use std::any::type_name;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, error, trace, warn};

use crate::{
    ChainDescriptor, ErasedPooled, Gate, LockKey, ObjectPool, Poolable, Pooled, RelayCore,
    Resolution, Result, Settled, StepContext, StepDriver, Ticket, metrics,
};

/// How a run of a chain ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(
    clippy::exhaustive_enums,
    reason = "a run either gets through all of its steps or it does not"
)]
pub enum ChainOutcome {
    /// Every step of the chain reported success.
    Completed,

    /// A step failed. If the chain has a failure step, it has run, whatever its own result.
    Failed,
}

/// Position of a run within its chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Cursor {
    Step(usize),
    Failure,
    Finished(ChainOutcome),
}

impl Cursor {
    fn after(self, resolution: Resolution, has_failure: bool) -> Self {
        match (self, resolution) {
            (Self::Step(index), Resolution::Done) => Self::Step(index.saturating_add(1)),
            (Self::Step(_), Resolution::Failed) if has_failure => Self::Failure,
            (Self::Step(_) | Self::Failure, Resolution::Failed) | (Self::Failure, Resolution::Done) => {
                Self::Finished(ChainOutcome::Failed)
            }
            (Self::Finished(outcome), _) => Self::Finished(outcome),
        }
    }
}

/// Everything a run needs to get going.
pub(crate) struct ChainStart<E: Poolable> {
    pub(crate) key: LockKey,
    pub(crate) relay: Weak<RelayCore>,
    pub(crate) pool: ObjectPool,
    pub(crate) chain: Rc<ChainDescriptor<E>>,
    pub(crate) event: Pooled<E>,
}

/// Drives one run of a chain triggered by an event of type `E`.
///
/// Engines are pooled like everything else. An engine holds the lock on its triggering event
/// from the start of the run until the run ends, across any number of retained steps.
pub(crate) struct ChainEngine<E: Poolable> {
    run: Option<ChainRun<E>>,
}

struct ChainRun<E: Poolable> {
    key: LockKey,
    relay: Weak<RelayCore>,
    pool: ObjectPool,
    chain: Rc<ChainDescriptor<E>>,
    event: Pooled<E>,
    cursor: Cursor,
    ticket: Ticket,

    /// The step that is executing or retained, if any.
    current: Option<ErasedPooled>,
    gate: Gate,
}

impl<E: Poolable> Default for ChainEngine<E> {
    fn default() -> Self {
        Self { run: None }
    }
}

impl<E: Poolable> Poolable for ChainEngine<E> {
    fn reset(&mut self) {
        self.run = None;
    }
}

impl<E: Poolable> ChainEngine<E> {
    /// Locks the triggering event and runs the chain until it ends or a step is retained.
    pub(crate) fn start(this: &Rc<RefCell<Self>>, start: ChainStart<E>) -> Result<()> {
        let ChainStart {
            key,
            relay,
            pool,
            chain,
            event,
        } = start;

        pool.lock(&event, key)?;

        metrics::CHAINS_STARTED.with(nm::Event::observe_once);
        debug!(
            event_type = type_name::<E>(),
            chain = %chain.id(),
            run = %key,
            steps = chain.len(),
            "chain run started"
        );

        this.borrow_mut().run = Some(ChainRun {
            key,
            relay,
            pool,
            chain,
            event,
            cursor: Cursor::Step(0),
            ticket: Ticket::first(key),
            current: None,
            gate: Gate::Idle,
        });

        Self::drive(this, None);
        Ok(())
    }

    /// Applies `resolution` to the current step, if any, then executes steps until the run
    /// ends or has to wait for a retained step.
    ///
    /// No borrow of the engine is held while user code (initializers, steps, hooks, pool
    /// reset hooks) runs.
    fn drive(this: &Rc<RefCell<Self>>, mut resolution: Option<Resolution>) {
        loop {
            if let Some(resolved) = resolution.take() {
                let finished_step = {
                    let mut engine = this.borrow_mut();
                    let Some(run) = engine.run.as_mut() else {
                        return;
                    };

                    run.cursor = run.cursor.after(resolved, run.chain.has_failure());
                    trace!(run = %run.key, ?resolved, cursor = ?run.cursor, "step resolved");

                    run.current.take().map(|step| (run.pool.clone(), step))
                };

                if let Some((pool, step)) = finished_step {
                    if let Err(error) = pool.free_erased(step.type_key(), Some(&step)) {
                        error!(%error, "failed to free chain step, terminating run");
                        Self::finish(this, ChainOutcome::Failed);
                        return;
                    }
                }
            }

            let (chain, cursor, pool, event) = {
                let engine = this.borrow();
                let Some(run) = engine.run.as_ref() else {
                    return;
                };

                (
                    Rc::clone(&run.chain),
                    run.cursor,
                    run.pool.clone(),
                    run.event.clone(),
                )
            };

            let allocator = match cursor {
                Cursor::Step(index) => chain.step(index).ok_or(ChainOutcome::Completed),
                Cursor::Failure => chain.failure().ok_or(ChainOutcome::Failed),
                Cursor::Finished(outcome) => Err(outcome),
            };

            let allocator = match allocator {
                Ok(allocator) => allocator,
                Err(outcome) => {
                    Self::finish(this, outcome);
                    return;
                }
            };

            let step = match allocator.allocate(&pool, &event) {
                Ok(step) => step,
                Err(error) => {
                    error!(%error, "failed to allocate chain step, terminating run");
                    Self::finish(this, ChainOutcome::Failed);
                    return;
                }
            };

            let ticket = {
                let mut engine = this.borrow_mut();
                let Some(run) = engine.run.as_mut() else {
                    return;
                };

                run.current = Some(step.clone());
                run.ticket = run.ticket.next();
                run.gate.begin();
                run.ticket
            };

            trace!(
                event_type = type_name::<E>(),
                step_type = step.type_key().name(),
                %ticket,
                "executing chain step"
            );

            let driver: Rc<dyn StepDriver> = Rc::<RefCell<Self>>::clone(this);

            let outcome = match allocator.execute(&step, StepContext::new(driver, ticket)) {
                Ok(outcome) => outcome,
                Err(error) => {
                    error!(%error, "failed to execute chain step, terminating run");
                    Self::finish(this, ChainOutcome::Failed);
                    return;
                }
            };

            let settled = {
                let mut engine = this.borrow_mut();
                let Some(run) = engine.run.as_mut() else {
                    return;
                };

                run.gate.settle(outcome)
            };

            match settled {
                Settled::Resolved(resolved) => resolution = Some(resolved),
                Settled::Suspended => {
                    metrics::STEPS_RETAINED.with(nm::Event::observe_once);
                    trace!(
                        step_type = step.type_key().name(),
                        %ticket,
                        "chain step retained, run parked"
                    );
                    return;
                }
                Settled::Stalled => {
                    warn!(
                        step_type = step.type_key().name(),
                        %ticket,
                        "chain step returned Retained without retaining its completion handle, run stays parked"
                    );
                    return;
                }
            }
        }
    }

    /// Ends the run: releases the event and hands the engine back to the relay.
    fn finish(this: &Rc<RefCell<Self>>, outcome: ChainOutcome) {
        let run = this.borrow_mut().run.take();
        let Some(mut run) = run else {
            return;
        };

        if let Some(step) = run.current.take() {
            if let Err(error) = run.pool.free_erased(step.type_key(), Some(&step)) {
                error!(%error, "failed to free chain step of finished run");
            }
        }

        run.chain.notify_finished(&run.event, outcome);

        if let Err(error) = run.pool.unlock(&run.event, run.key) {
            error!(%error, run = %run.key, "failed to release triggering event");
        }

        match outcome {
            ChainOutcome::Completed => metrics::CHAINS_COMPLETED.with(nm::Event::observe_once),
            ChainOutcome::Failed => metrics::CHAINS_FAILED.with(nm::Event::observe_once),
        }

        debug!(
            event_type = type_name::<E>(),
            chain = %run.chain.id(),
            run = %run.key,
            ?outcome,
            "chain run finished"
        );

        if let Some(relay) = run.relay.upgrade() {
            relay.finish(run.key);
        }
    }
}

impl<E: Poolable> StepDriver for RefCell<ChainEngine<E>> {
    fn retained(&self, ticket: Ticket) {
        let mut engine = self.borrow_mut();

        if let Some(run) = engine.run.as_mut().filter(|run| run.ticket == ticket) {
            run.gate.mark_retained();
        }
    }

    fn resume(self: Rc<Self>, ticket: Ticket, resolution: Resolution) {
        let resume_now = {
            let mut engine = self.borrow_mut();

            match engine.run.as_mut() {
                Some(run) if run.ticket == ticket => run.gate.resume(resolution),
                _ => {
                    trace!(%ticket, "ignoring completion of a step that is no longer running");
                    false
                }
            }
        };

        if resume_now {
            ChainEngine::drive(&self, Some(resolution));
        }
    }
}

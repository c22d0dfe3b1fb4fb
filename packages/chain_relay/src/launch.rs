use std::any::type_name;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, error, trace, warn};

use crate::{
    Gate, LockKey, ObjectPool, Poolable, Pooled, RelayCore, Resolution, Settled, Step,
    StepContext, StepDriver, Ticket, metrics,
};

/// Runs a single step outside of any chain.
///
/// There is no triggering event and no failure path: whether the step succeeds or fails, it
/// is freed and the engine is handed back to the relay.
pub(crate) struct LaunchEngine<S: Step> {
    run: Option<LaunchRun<S>>,
}

struct LaunchRun<S: Step> {
    key: LockKey,
    relay: Weak<RelayCore>,
    pool: ObjectPool,
    step: Pooled<S>,
    ticket: Ticket,
    gate: Gate,
}

impl<S: Step> Default for LaunchEngine<S> {
    fn default() -> Self {
        Self { run: None }
    }
}

impl<S: Step> Poolable for LaunchEngine<S> {
    fn reset(&mut self) {
        self.run = None;
    }
}

impl<S: Step> LaunchEngine<S> {
    pub(crate) fn start(
        this: &Rc<RefCell<Self>>,
        key: LockKey,
        relay: Weak<RelayCore>,
        pool: ObjectPool,
        step: Pooled<S>,
    ) {
        let ticket = Ticket::first(key).next();

        metrics::LAUNCHES.with(nm::Event::observe_once);
        debug!(step_type = type_name::<S>(), run = %key, "step launched");

        let mut gate = Gate::Idle;
        gate.begin();

        this.borrow_mut().run = Some(LaunchRun {
            key,
            relay,
            pool,
            step: step.clone(),
            ticket,
            gate,
        });

        let driver: Rc<dyn StepDriver> = Rc::<RefCell<Self>>::clone(this);
        let outcome = step.borrow_mut().execute(StepContext::new(driver, ticket));

        let settled = {
            let mut engine = this.borrow_mut();
            let Some(run) = engine.run.as_mut() else {
                return;
            };

            run.gate.settle(outcome)
        };

        match settled {
            Settled::Resolved(resolution) => Self::finish(this, resolution),
            Settled::Suspended => {
                metrics::STEPS_RETAINED.with(nm::Event::observe_once);
                trace!(step_type = type_name::<S>(), %ticket, "launched step retained");
            }
            Settled::Stalled => {
                warn!(
                    step_type = type_name::<S>(),
                    %ticket,
                    "launched step returned Retained without retaining its completion handle"
                );
            }
        }
    }

    fn finish(this: &Rc<RefCell<Self>>, resolution: Resolution) {
        let run = this.borrow_mut().run.take();
        let Some(run) = run else {
            return;
        };

        if let Err(error) = run.pool.free(run.step) {
            error!(%error, run = %run.key, "failed to free launched step");
        }

        debug!(
            step_type = type_name::<S>(),
            run = %run.key,
            ?resolution,
            "launched step finished"
        );

        if let Some(relay) = run.relay.upgrade() {
            relay.finish(run.key);
        }
    }
}

impl<S: Step> StepDriver for RefCell<LaunchEngine<S>> {
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
                    trace!(%ticket, "ignoring completion of a launch that is no longer running");
                    false
                }
            }
        };

        if resume_now {
            LaunchEngine::finish(&self, resolution);
        }
    }
}

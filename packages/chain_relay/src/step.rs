use std::any::type_name;
use std::fmt;
use std::mem;
use std::rc::Rc;

use crate::{LockKey, Poolable};

/// What a [`Step`] reports back from [`Step::execute()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(
    clippy::exhaustive_enums,
    reason = "a step either finished, failed or is still pending; there is no fourth state"
)]
pub enum Outcome {
    /// The step succeeded. The chain advances to its next step.
    Done,

    /// The step failed. The chain branches to its failure step, if it has one, or ends.
    Failed,

    /// The step will report its result later through the [`StepCompletion`] obtained from
    /// [`StepContext::retain()`]. The chain stays parked until then.
    Retained,
}

/// A pooled unit of work that runs as part of a chain or as a standalone launch.
///
/// Steps are allocated from the [`ObjectPool`][crate::ObjectPool] right before they run and
/// freed right after they report a result, so a step holds no state across runs beyond what
/// [`Poolable::reset()`] clears.
///
/// # Example
///
/// ```
/// use chain_relay::{Outcome, Poolable, Step, StepContext};
///
/// #[derive(Default)]
/// struct ValidateName {
///     name: String,
/// }
///
/// impl Poolable for ValidateName {
///     fn reset(&mut self) {
///         self.name.clear();
///     }
/// }
///
/// impl Step for ValidateName {
///     fn execute(&mut self, _context: StepContext) -> Outcome {
///         if self.name.is_empty() {
///             Outcome::Failed
///         } else {
///             Outcome::Done
///         }
///     }
/// }
/// ```
pub trait Step: Poolable {
    /// Runs the step.
    ///
    /// To finish asynchronously, call [`StepContext::retain()`], keep the returned
    /// [`StepCompletion`] wherever the later callback can reach it and return
    /// [`Outcome::Retained`].
    fn execute(&mut self, context: StepContext) -> Outcome;
}

/// The result a retained step eventually signals.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Resolution {
    Done,
    Failed,
}

/// Identifies one execution of one step within one run.
///
/// Signals that carry a ticket other than the one the driver is currently waiting on are
/// ignored, which makes completion handles that outlived their step harmless.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Ticket {
    run: LockKey,
    step: u64,
}

impl Ticket {
    pub(crate) fn first(run: LockKey) -> Self {
        Self { run, step: 0 }
    }

    #[must_use]
    pub(crate) fn next(self) -> Self {
        Self {
            run: self.run,
            step: self.step.wrapping_add(1),
        }
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/step#{}", self.run, self.step)
    }
}

/// Whatever runs steps and can be told about their deferred results.
pub(crate) trait StepDriver {
    /// The step executing under `ticket` has obtained its completion handle.
    fn retained(&self, ticket: Ticket);

    /// The step executing under `ticket` has signaled its result.
    fn resume(self: Rc<Self>, ticket: Ticket, resolution: Resolution);
}

/// Passed to [`Step::execute()`]; the gateway to finishing the step asynchronously.
pub struct StepContext {
    driver: Rc<dyn StepDriver>,
    ticket: Ticket,
}

impl StepContext {
    pub(crate) fn new(driver: Rc<dyn StepDriver>, ticket: Ticket) -> Self {
        Self { driver, ticket }
    }

    /// Obtains the handle through which the step will later report its result.
    ///
    /// The step must then return [`Outcome::Retained`] from [`Step::execute()`]. Signaling
    /// through the handle before `execute()` returns is allowed; the result is applied as soon
    /// as `execute()` returns.
    #[must_use]
    pub fn retain(self) -> StepCompletion {
        self.driver.retained(self.ticket);

        StepCompletion {
            driver: self.driver,
            ticket: self.ticket,
        }
    }
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

/// Handle through which a retained step reports its result.
///
/// Each handle signals at most once. A handle whose step has already been resolved by other
/// means is silently ignored.
///
/// # Example
///
/// ```
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// use chain_relay::{Outcome, Poolable, Step, StepCompletion, StepContext};
///
/// /// Completes once the server replies.
/// struct AwaitReply {
///     pending: Rc<RefCell<Option<StepCompletion>>>,
/// }
///
/// impl Poolable for AwaitReply {
///     fn reset(&mut self) {}
/// }
///
/// impl Step for AwaitReply {
///     fn execute(&mut self, context: StepContext) -> Outcome {
///         *self.pending.borrow_mut() = Some(context.retain());
///         Outcome::Retained
///     }
/// }
///
/// // Later, in the reply callback:
/// fn on_reply(pending: &RefCell<Option<StepCompletion>>, ok: bool) {
///     if let Some(completion) = pending.borrow_mut().take() {
///         if ok {
///             completion.done();
///         } else {
///             completion.fail();
///         }
///     }
/// }
/// ```
#[must_use = "a retained step stays pending until its completion handle signals"]
pub struct StepCompletion {
    driver: Rc<dyn StepDriver>,
    ticket: Ticket,
}

impl StepCompletion {
    /// Reports that the step succeeded.
    pub fn done(self) {
        self.driver.resume(self.ticket, Resolution::Done);
    }

    /// Reports that the step failed.
    pub fn fail(self) {
        self.driver.resume(self.ticket, Resolution::Failed);
    }
}

impl fmt::Debug for StepCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

/// Suspension state of a driver with respect to its current step.
///
/// Results may arrive while the step's `execute()` is still on the stack, in which case they
/// are held until `execute()` returns so the driver never re-enters itself.
#[derive(Debug)]
pub(crate) enum Gate {
    Idle,
    Executing {
        deferred: Option<Resolution>,
        retained: bool,
    },
    Suspended,
}

/// What the driver should do after a step's `execute()` returned.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Settled {
    /// Apply this result now.
    Resolved(Resolution),

    /// Wait for the completion handle to signal.
    Suspended,

    /// The step returned [`Outcome::Retained`] without obtaining a completion handle.
    Stalled,
}

impl Gate {
    pub(crate) fn begin(&mut self) {
        *self = Self::Executing {
            deferred: None,
            retained: false,
        };
    }

    pub(crate) fn mark_retained(&mut self) {
        if let Self::Executing { retained, .. } = self {
            *retained = true;
        }
    }

    /// Accepts a signaled result, returning whether the driver must resume right away.
    pub(crate) fn resume(&mut self, resolution: Resolution) -> bool {
        match self {
            Self::Executing { deferred, .. } => {
                if deferred.is_none() {
                    *deferred = Some(resolution);
                }
                false
            }
            Self::Suspended => {
                *self = Self::Idle;
                true
            }
            Self::Idle => false,
        }
    }

    pub(crate) fn settle(&mut self, outcome: Outcome) -> Settled {
        let state = mem::replace(self, Self::Idle);

        match (outcome, state) {
            (Outcome::Done, _) => Settled::Resolved(Resolution::Done),
            (Outcome::Failed, _) => Settled::Resolved(Resolution::Failed),
            (
                Outcome::Retained,
                Self::Executing {
                    deferred: Some(resolution),
                    ..
                },
            ) => Settled::Resolved(resolution),
            (
                Outcome::Retained,
                Self::Executing {
                    deferred: None,
                    retained: true,
                },
            ) => {
                *self = Self::Suspended;
                Settled::Suspended
            }
            (Outcome::Retained, _) => {
                *self = Self::Suspended;
                Settled::Stalled
            }
        }
    }
}

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Single-threaded event-driven execution built on pooled, reusable instances.
//!
//! This crate combines three cooperating mechanisms that together let an application react
//! to events with multi-step command chains without allocating once warmed up:
//!
//! * [`ObjectPool`] - a type-keyed recycling store. Instances carry a set of owner locks
//!   and only return to circulation once every owner has released them.
//! * [`EventBus`] - a typed publish/subscribe dispatcher whose events are pooled
//!   instances. Listeners may modify the bus from within a dispatch.
//! * [`Relay`] - binds published events to chains of [`Step`]s. Every publish starts an
//!   independent run per installed chain; a step can finish right away or retain its run
//!   and finish later from an unrelated callback.
//!
//! A [`ModelRegistry`] rounds this off by tracking live pooled models and announcing their
//! creation and destruction on the bus.
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use chain_relay::{
//!     EventBus, ObjectPool, Outcome, Poolable, Relay, Step, StepCompletion, StepContext,
//! };
//!
//! #[derive(Default)]
//! struct LoginRequested {
//!     username: String,
//! }
//!
//! impl Poolable for LoginRequested {
//!     fn reset(&mut self) {
//!         self.username.clear();
//!     }
//! }
//!
//! type Pending = Rc<RefCell<Option<StepCompletion>>>;
//!
//! /// Sends the login to the server and waits for the reply.
//! struct Login {
//!     username: String,
//!     pending: Pending,
//! }
//!
//! impl Poolable for Login {
//!     fn reset(&mut self) {
//!         self.username.clear();
//!     }
//! }
//!
//! impl Step for Login {
//!     fn execute(&mut self, context: StepContext) -> Outcome {
//!         *self.pending.borrow_mut() = Some(context.retain());
//!         Outcome::Retained
//!     }
//! }
//!
//! let pending: Pending = Rc::default();
//!
//! let pool = ObjectPool::new();
//! pool.register::<LoginRequested>();
//! pool.register_with({
//!     let pending = Rc::clone(&pending);
//!     move || Login {
//!         username: String::new(),
//!         pending: Rc::clone(&pending),
//!     }
//! });
//!
//! let relay = Relay::new(EventBus::new(pool));
//! relay
//!     .on::<LoginRequested>()
//!     .add_step_with::<Login, _>(|login, event| {
//!         login.username.clone_from(&event.borrow().username);
//!     })
//!     .install()
//!     .unwrap();
//!
//! relay
//!     .bus()
//!     .publish_with::<LoginRequested>(|event| event.username.push_str("ferris"))
//!     .unwrap();
//!
//! // The chain is parked on the login step until the server replies.
//! assert_eq!(relay.active_count(), 1);
//!
//! let reply = pending.borrow_mut().take().unwrap();
//! reply.done();
//!
//! assert_eq!(relay.active_count(), 0);
//! ```
//!
//! # Single-threaded design
//!
//! Every type in this crate is a handle to shared single-threaded state and is neither
//! [`Send`] nor [`Sync`]. Reentrancy is supported throughout: listeners, steps, initializers
//! and reset hooks may call back into the pool, the bus and the relay.

mod bus;
mod chain;
mod engine;
mod error;
mod launch;
mod listeners;
mod lock_set;
mod metrics;
mod pool;
mod pool_builder;
mod poolable;
mod pooled;
mod registry;
mod relay;
mod step;
mod step_allocator;
mod type_key;

pub use bus::*;
pub use chain::{ChainBuilder, ChainId};
pub(crate) use chain::ChainDescriptor;
pub use engine::ChainOutcome;
pub(crate) use engine::{ChainEngine, ChainStart};
pub use error::*;
pub(crate) use launch::*;
pub(crate) use listeners::*;
pub use lock_set::LockKey;
pub(crate) use lock_set::LockSet;
pub use pool::*;
pub use pool_builder::*;
pub use poolable::*;
pub(crate) use pooled::Slot;
pub use pooled::{ErasedPooled, InstanceId, Pooled};
pub use registry::*;
pub(crate) use relay::RelayCore;
pub use relay::Relay;
pub(crate) use step::{Gate, Resolution, Settled, StepDriver, Ticket};
pub use step::{Outcome, Step, StepCompletion, StepContext};
pub(crate) use step_allocator::*;
pub use type_key::*;
